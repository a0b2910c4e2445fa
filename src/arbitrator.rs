//! Channel arbitration between the local key and the remote peer.
//!
//! The [`LinkArbitrator`] owns the one [`ConnectionState`] of the node. Local
//! presses come from the telegrapher, remote ones from the wire. When both
//! sides key at once the channel is in contention until the next
//! [`LinkArbitrator::update`] picks a winner.
//!
//! Every mutating entry point takes `&self` and runs under a single "in
//! arbitration" flag. A call made while another one is still running (for
//! example from inside a state change subscriber) is dropped and logged.

use std::{
    cell::{Cell, RefCell},
    fmt,
};

use common::Symbol;
use log::{debug, info, trace, warn};

use crate::config::LinkTiming;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    Free,
    Tx,
    Rx,
    Contention,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Free => "FREE",
            ConnectionState::Tx => "TX",
            ConnectionState::Rx => "RX",
            ConnectionState::Contention => "CONTENTION",
        };
        f.write_str(name)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Side {
    Local,
    Remote,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PressRecord {
    pub pressed: bool,
    pub pressed_at: u64,
}

struct Inner {
    state: ConnectionState,
    local: PressRecord,
    remote: PressRecord,
    last_activity_ms: u64,
}

type StateSubscriber = Box<dyn FnMut(ConnectionState)>;
type SymbolSubscriber = Box<dyn FnMut(Side, Symbol, u64)>;

pub struct LinkArbitrator {
    timing: LinkTiming,
    inner: RefCell<Inner>,
    in_arbitration: Cell<bool>,
    guarded_calls: Cell<u32>,
    state_subscribers: RefCell<Vec<StateSubscriber>>,
    symbol_subscribers: RefCell<Vec<SymbolSubscriber>>,
}

/// Clears the arbitration flag when the entry point returns
struct Arbitration<'a>(&'a Cell<bool>);

impl Drop for Arbitration<'_> {
    fn drop(&mut self) {
        self.0.set(false);
    }
}

impl LinkArbitrator {
    pub fn new(timing: LinkTiming, now: u64) -> Self {
        Self {
            timing,
            inner: RefCell::new(Inner {
                state: ConnectionState::Free,
                local: PressRecord::default(),
                remote: PressRecord::default(),
                last_activity_ms: now,
            }),
            in_arbitration: Cell::new(false),
            guarded_calls: Cell::new(0),
            state_subscribers: RefCell::new(Vec::new()),
            symbol_subscribers: RefCell::new(Vec::new()),
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.borrow().state
    }

    pub fn last_activity_ms(&self) -> u64 {
        self.inner.borrow().last_activity_ms
    }

    pub fn local_press(&self) -> PressRecord {
        self.inner.borrow().local
    }

    pub fn remote_press(&self) -> PressRecord {
        self.inner.borrow().remote
    }

    /// Calls dropped because they arrived during another arbitration call
    pub fn guarded_calls(&self) -> u32 {
        self.guarded_calls.get()
    }

    /// Called synchronously on every state change
    pub fn on_state_change(&self, subscriber: impl FnMut(ConnectionState) + 'static) {
        let Some(_arbitration) = self.enter("on_state_change") else {
            return;
        };
        self.state_subscribers
            .borrow_mut()
            .push(Box::new(subscriber));
    }

    /// Called for every accepted symbol, local or remote
    pub fn on_symbol(&self, subscriber: impl FnMut(Side, Symbol, u64) + 'static) {
        let Some(_arbitration) = self.enter("on_symbol") else {
            return;
        };
        self.symbol_subscribers
            .borrow_mut()
            .push(Box::new(subscriber));
    }

    pub fn request_local_down(&self, now: u64) {
        let Some(_arbitration) = self.enter("request_local_down") else {
            return;
        };
        self.press(Side::Local, now);
    }

    pub fn request_local_up(&self, now: u64) {
        let Some(_arbitration) = self.enter("request_local_up") else {
            return;
        };
        self.release(Side::Local, now);
    }

    pub fn request_local_symbol(&self, symbol: Symbol, duration_ms: u64, now: u64) {
        let Some(_arbitration) = self.enter("request_local_symbol") else {
            return;
        };
        self.symbol(Side::Local, symbol, duration_ms, now);
    }

    pub fn notify_remote_down(&self, now: u64) {
        let Some(_arbitration) = self.enter("notify_remote_down") else {
            return;
        };
        self.press(Side::Remote, now);
    }

    pub fn notify_remote_up(&self, now: u64) {
        let Some(_arbitration) = self.enter("notify_remote_up") else {
            return;
        };
        self.release(Side::Remote, now);
    }

    pub fn notify_remote_symbol(&self, symbol: Symbol, duration_ms: u64, now: u64) {
        let Some(_arbitration) = self.enter("notify_remote_symbol") else {
            return;
        };
        self.symbol(Side::Remote, symbol, duration_ms, now);
    }

    /// Resolve contention and expire an idle channel. Call once per tick.
    pub fn update(&self, now: u64) {
        let Some(_arbitration) = self.enter("update") else {
            return;
        };

        if self.state() == ConnectionState::Contention {
            // Coin flip on the tick time
            let winner = if now % 2 == 0 {
                ConnectionState::Tx
            } else {
                ConnectionState::Rx
            };
            info!("arbitrator: contention at {}ms resolved to {}", now, winner);
            self.set_state(winner, now);
        }

        let expired = {
            let inner = self.inner.borrow();
            inner.state != ConnectionState::Free
                && !inner.local.pressed
                && !inner.remote.pressed
                && now.saturating_sub(inner.last_activity_ms) >= self.timing.activity_timeout_ms
        };
        if expired {
            info!("arbitrator: no activity for {}ms", self.timing.activity_timeout_ms);
            self.set_state(ConnectionState::Free, now);
        }
    }

    fn enter(&self, entry: &str) -> Option<Arbitration<'_>> {
        if self.in_arbitration.replace(true) {
            self.guarded_calls.set(self.guarded_calls.get().wrapping_add(1));
            warn!("arbitrator: re-entrant {} ignored", entry);
            return None;
        }
        Some(Arbitration(&self.in_arbitration))
    }

    fn press(&self, side: Side, now: u64) {
        let target = {
            let mut guard = self.inner.borrow_mut();
            let inner = &mut *guard;
            let (this, other) = match side {
                Side::Local => (&mut inner.local, inner.remote),
                Side::Remote => (&mut inner.remote, inner.local),
            };
            if this.pressed {
                trace!("arbitrator: {:?} already down", side);
                return;
            }
            this.pressed = true;
            this.pressed_at = now;

            if other.pressed {
                ConnectionState::Contention
            } else {
                match side {
                    Side::Local => ConnectionState::Tx,
                    Side::Remote => ConnectionState::Rx,
                }
            }
        };
        self.set_state(target, now);
    }

    fn release(&self, side: Side, now: u64) {
        let target = {
            let mut guard = self.inner.borrow_mut();
            let inner = &mut *guard;
            let state = inner.state;
            let (this, other) = match side {
                Side::Local => (&mut inner.local, inner.remote),
                Side::Remote => (&mut inner.remote, inner.local),
            };
            if !this.pressed {
                trace!("arbitrator: {:?} already up", side);
                return;
            }
            this.pressed = false;

            // The side still holding the key gets the channel
            let (held, ours) = match side {
                Side::Local => (ConnectionState::Rx, ConnectionState::Tx),
                Side::Remote => (ConnectionState::Tx, ConnectionState::Rx),
            };
            if other.pressed {
                held
            } else if state == ours || state == ConnectionState::Contention {
                ConnectionState::Free
            } else {
                state
            }
        };
        self.set_state(target, now);
    }

    fn symbol(&self, side: Side, symbol: Symbol, duration_ms: u64, now: u64) {
        self.inner.borrow_mut().last_activity_ms = now;

        if duration_ms < self.timing.min_symbol_ms {
            debug!(
                "arbitrator: {:?} glitch {} ({}ms) ignored",
                side, symbol, duration_ms
            );
            return;
        }

        for subscriber in self.symbol_subscribers.borrow_mut().iter_mut() {
            subscriber(side, symbol, duration_ms);
        }
    }

    /// Every call counts as activity; subscribers only hear about changes
    fn set_state(&self, state: ConnectionState, now: u64) {
        let previous = {
            let mut inner = self.inner.borrow_mut();
            inner.last_activity_ms = now;
            std::mem::replace(&mut inner.state, state)
        };
        if previous == state {
            return;
        }

        info!("arbitrator: {} -> {}", previous, state);
        for subscriber in self.state_subscribers.borrow_mut().iter_mut() {
            subscriber(state);
        }
    }
}
