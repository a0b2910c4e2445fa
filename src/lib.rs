pub mod arbitrator;
pub mod clock;
pub mod config;
pub mod key;
pub mod telegrapher;
pub mod transceiver;
pub mod transport;

pub use common::{Symbol, WireMessage};

pub mod prelude {
    pub use crate::{
        arbitrator::{ConnectionState, LinkArbitrator, Side},
        clock::MonotonicClock,
        config::*,
        key::{KeyEdge, KeyEdgeQueue},
        telegrapher::{TelegraphEvent, Telegrapher},
        transceiver::Transceiver,
        transport::{
            host::HostRadio, PeerInfo, PeerRole, TransportConnector, TransportEvent,
            TransportState,
        },
    };
    pub use common::Symbol;
}
