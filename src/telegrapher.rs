//! Key timing classifier.
//!
//! The [`Telegrapher`] drains key edges, turns press lengths into dots and
//! dashes, and reports long holds and finished letters. Remote activity
//! decoded off the wire is re-emitted through the same event stream so
//! consumers see one feed for both ends.

use std::{fmt, sync::Arc};

use common::Symbol;
use log::{debug, info, trace};
use tokio::sync::mpsc;

use crate::{
    config::LinkTiming,
    key::{KeyEdge, KeyEdgeQueue},
};

pub const LETTER_CAPACITY: usize = 16;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TelegraphEvent {
    LocalDown,
    LocalUp,
    LocalSymbol { symbol: Symbol, duration_ms: u64 },
    /// The letter being keyed is complete
    Finalize { pattern: String },
    LongPress,
    RemoteDown,
    RemoteUp,
    RemoteSymbol { symbol: Symbol, duration_ms: u64 },
}

/// Symbols of the letter currently being keyed
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LetterBuffer {
    symbols: heapless::Vec<Symbol, LETTER_CAPACITY>,
}

impl LetterBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns false once the buffer is full
    pub fn push(&mut self, symbol: Symbol) -> bool {
        self.symbols.push(symbol).is_ok()
    }

    pub fn clear(&mut self) {
        self.symbols.clear();
    }

    pub fn len(&self) -> usize {
        self.symbols.len()
    }

    pub fn is_empty(&self) -> bool {
        self.symbols.is_empty()
    }
}

impl fmt::Display for LetterBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for symbol in self.symbols.iter() {
            write!(f, "{}", symbol)?;
        }
        Ok(())
    }
}

pub struct Telegrapher {
    timing: LinkTiming,
    edges: Arc<KeyEdgeQueue>,
    boot_ms: u64,

    pressed: bool,
    press_start_ms: u64,
    long_press_fired: bool,

    letter: LetterBuffer,
    /// Set on release, cleared by the next press or by Finalize
    gap_open: bool,
    last_release_ms: u64,

    subscribers: Vec<mpsc::UnboundedSender<TelegraphEvent>>,
}

impl Telegrapher {
    pub fn new(timing: LinkTiming, edges: Arc<KeyEdgeQueue>, boot_ms: u64) -> Self {
        Self {
            timing,
            edges,
            boot_ms,
            pressed: false,
            press_start_ms: 0,
            long_press_fired: false,
            letter: LetterBuffer::new(),
            gap_open: false,
            last_release_ms: 0,
            subscribers: Vec::new(),
        }
    }

    /// New receiver for every event emitted from now on
    pub fn subscribe(&mut self) -> mpsc::UnboundedReceiver<TelegraphEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.push(tx);
        rx
    }

    /// Interrupt-safe, only touches the edge queue
    pub fn push_key_event(&self, edge: KeyEdge) {
        self.edges.push(edge);
    }

    pub fn is_pressed(&self) -> bool {
        self.pressed
    }

    pub fn letter(&self) -> &LetterBuffer {
        &self.letter
    }

    /// Drain every queued edge, then run the hold and gap timers
    pub fn update(&mut self, now: u64) {
        while let Some(edge) = self.edges.pop() {
            self.handle_edge(edge);
        }

        if self.pressed && !self.long_press_fired {
            let held = now.saturating_sub(self.press_start_ms);
            if held >= self.timing.long_press_ms && self.past_boot_grace(now) {
                self.fire_long_press(held);
            }
        }

        if !self.pressed
            && self.gap_open
            && now.saturating_sub(self.last_release_ms) >= self.timing.letter_gap_ms
        {
            self.gap_open = false;
            let pattern = self.letter.to_string();
            self.letter.clear();
            debug!("telegrapher: letter finished {:?}", pattern);
            self.emit(TelegraphEvent::Finalize { pattern });
        }
    }

    pub fn handle_remote_down(&mut self) {
        self.emit(TelegraphEvent::RemoteDown);
    }

    pub fn handle_remote_up(&mut self) {
        self.emit(TelegraphEvent::RemoteUp);
    }

    pub fn handle_remote_symbol(&mut self, symbol: Symbol, duration_ms: u64) {
        self.emit(TelegraphEvent::RemoteSymbol {
            symbol,
            duration_ms,
        });
    }

    fn handle_edge(&mut self, edge: KeyEdge) {
        let at = edge.timestamp_ms();

        if edge.down {
            if self.pressed {
                trace!("telegrapher: duplicate down at {}ms", at);
                return;
            }

            self.pressed = true;
            self.press_start_ms = at;
            self.long_press_fired = false;
            if !self.gap_open {
                self.letter.clear();
            }
            self.gap_open = false;
            self.emit(TelegraphEvent::LocalDown);
            return;
        }

        if !self.pressed {
            trace!("telegrapher: duplicate up at {}ms", at);
            return;
        }

        self.pressed = false;
        self.gap_open = true;
        self.last_release_ms = at;
        let duration = at.saturating_sub(self.press_start_ms);

        // A hold that outlived the long press threshold between two ticks
        if !self.long_press_fired
            && duration >= self.timing.long_press_ms
            && self.past_boot_grace(at)
        {
            self.fire_long_press(duration);
        }

        if self.long_press_fired {
            trace!("telegrapher: release after long press ({}ms)", duration);
        } else if duration < self.timing.min_down_ms {
            trace!("telegrapher: bounce ({}ms)", duration);
        } else {
            let symbol = if duration <= self.timing.dot_max_ms {
                Symbol::Dot
            } else {
                Symbol::Dash
            };
            if !self.letter.push(symbol) {
                debug!("telegrapher: letter full, {} not kept", symbol);
            }
            self.emit(TelegraphEvent::LocalSymbol {
                symbol,
                duration_ms: duration,
            });
        }

        self.emit(TelegraphEvent::LocalUp);
    }

    fn past_boot_grace(&self, now: u64) -> bool {
        now.saturating_sub(self.boot_ms) >= self.timing.boot_grace_ms
    }

    fn fire_long_press(&mut self, held: u64) {
        self.long_press_fired = true;
        self.letter.clear();
        info!("telegrapher: long press ({}ms)", held);
        self.emit(TelegraphEvent::LongPress);
    }

    fn emit(&mut self, event: TelegraphEvent) {
        self.subscribers.retain(|tx| tx.send(event.clone()).is_ok());
    }
}
