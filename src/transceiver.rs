use std::{rc::Rc, sync::Arc};

use common::{decode, Decoded, WireMessage};
use log::{debug, info};
use tokio::sync::mpsc;

use crate::{
    arbitrator::LinkArbitrator,
    config::Config,
    key::KeyEdgeQueue,
    telegrapher::{TelegraphEvent, Telegrapher},
    transport::{radio::Radio, TransportConnector, TransportEvent},
};

/// One node: key classifier, arbitrator and transport wired together.
///
/// [`Transceiver::tick`] is the whole cadence of the node. Nothing inside
/// calls its own `update` again; anything an event causes is picked up by a
/// later step of the same tick or by the next tick.
pub struct Transceiver<R: Radio> {
    telegrapher: Telegrapher,
    arbitrator: Rc<LinkArbitrator>,
    transport: TransportConnector<R>,
    local_id: String,
    events: mpsc::UnboundedReceiver<TelegraphEvent>,
    transport_events: mpsc::UnboundedReceiver<TransportEvent>,
}

impl<R: Radio> Transceiver<R> {
    pub fn new(config: &Config, edges: Arc<KeyEdgeQueue>, radio: R, now: u64) -> Self {
        let mut telegrapher = Telegrapher::new(config.timing.clone(), edges, now);
        let events = telegrapher.subscribe();
        let arbitrator = Rc::new(LinkArbitrator::new(config.timing.clone(), now));
        let mut transport = TransportConnector::new(radio, config.network.clone(), now);
        let transport_events = transport.subscribe();
        let local_id = transport.local_id().to_string();

        Self {
            telegrapher,
            arbitrator,
            transport,
            local_id,
            events,
            transport_events,
        }
    }

    pub fn local_id(&self) -> &str {
        &self.local_id
    }

    /// Handle for subscribing to state changes and symbols
    pub fn arbitrator(&self) -> &Rc<LinkArbitrator> {
        &self.arbitrator
    }

    pub fn telegrapher(&self) -> &Telegrapher {
        &self.telegrapher
    }

    pub fn transport(&self) -> &TransportConnector<R> {
        &self.transport
    }

    /// Local and remote key activity, for display and sidetone consumers
    pub fn subscribe(&mut self) -> mpsc::UnboundedReceiver<TelegraphEvent> {
        self.telegrapher.subscribe()
    }

    pub fn subscribe_transport(&mut self) -> mpsc::UnboundedReceiver<TransportEvent> {
        self.transport.subscribe()
    }

    pub fn tick(&mut self, now: u64) {
        // Edges first, then the hold and gap timers
        self.telegrapher.update(now);
        self.route_key_events(now);

        self.transport.update(now);
        while let Ok(event) = self.transport_events.try_recv() {
            self.handle_transport_event(event);
        }

        // Remote activity decoded above
        self.route_key_events(now);

        self.arbitrator.update(now);
    }

    fn route_key_events(&mut self, now: u64) {
        while let Ok(event) = self.events.try_recv() {
            match event {
                TelegraphEvent::LocalDown => {
                    self.arbitrator.request_local_down(now);
                    self.send(WireMessage::Down, now);
                }
                TelegraphEvent::LocalUp => {
                    self.arbitrator.request_local_up(now);
                    self.send(WireMessage::Up, now);
                }
                TelegraphEvent::LocalSymbol {
                    symbol,
                    duration_ms,
                } => {
                    self.arbitrator
                        .request_local_symbol(symbol, duration_ms, now);
                    self.send(
                        WireMessage::Symbol {
                            symbol,
                            duration_ms,
                        },
                        now,
                    );
                }
                TelegraphEvent::Finalize { pattern } => {
                    debug!("transceiver: letter {:?}", pattern);
                }
                TelegraphEvent::LongPress => {
                    info!("transceiver: long press");
                }
                TelegraphEvent::RemoteDown => self.arbitrator.notify_remote_down(now),
                TelegraphEvent::RemoteUp => self.arbitrator.notify_remote_up(now),
                TelegraphEvent::RemoteSymbol {
                    symbol,
                    duration_ms,
                } => self
                    .arbitrator
                    .notify_remote_symbol(symbol, duration_ms, now),
            }
        }
    }

    fn handle_transport_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Line(line) => match decode(&line, &self.local_id) {
                Decoded::Message(WireMessage::Down) => self.telegrapher.handle_remote_down(),
                Decoded::Message(WireMessage::Up) => self.telegrapher.handle_remote_up(),
                Decoded::Message(WireMessage::Symbol {
                    symbol,
                    duration_ms,
                }) => self.telegrapher.handle_remote_symbol(symbol, duration_ms),
                Decoded::SelfEcho => debug!("transceiver: dropped own line {:?}", line),
                Decoded::Heartbeat(_) => {}
                Decoded::Unknown => debug!("transceiver: unknown line {:?}", line),
            },
            TransportEvent::Disconnected => {
                // A peer that vanished mid-press must not keep the channel
                if self.arbitrator.remote_press().pressed {
                    info!("transceiver: releasing remote key of lost peer");
                    self.telegrapher.handle_remote_up();
                }
            }
            TransportEvent::Connected { peer } => {
                info!("transceiver: linked to {} as {:?}", peer.ip, peer.role);
            }
            TransportEvent::AcceptedClient(ip) => {
                debug!("transceiver: accepted {}", ip);
            }
        }
    }

    fn send(&mut self, message: WireMessage, now: u64) {
        let line = message.encode(&self.local_id);
        self.transport.enqueue_outgoing(line, now);
    }
}
