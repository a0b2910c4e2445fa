use alloc::{format, string::String};
use core::fmt::{self, Display};

/// Heartbeat line sent by the side that initiated the connection
pub const HEARTBEAT: &str = "alive";
/// Reply to a heartbeat, sent by the side that accepted the connection
pub const HEARTBEAT_ACK: &str = "alive_ack";

/// A single Morse element as produced by the key classifier.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Symbol {
    Dot,
    Dash,
}

impl Symbol {
    pub fn as_char(self) -> char {
        match self {
            Symbol::Dot => '.',
            Symbol::Dash => '-',
        }
    }

    pub fn from_char(c: char) -> Option<Self> {
        match c {
            '.' => Some(Symbol::Dot),
            '-' => Some(Symbol::Dash),
            _ => None,
        }
    }
}

impl Display for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_char())
    }
}

/// The semantic messages exchanged between two transceivers. Every one of
/// them is tagged with the sender's id on the wire so a node can recognise
/// (and drop) its own lines if they ever come back.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum WireMessage {
    /// Remote key pressed
    Down,
    /// Remote key released
    Up,
    /// Remote classified element, with the press duration in milliseconds
    Symbol { symbol: Symbol, duration_ms: u64 },
}

impl WireMessage {
    /// Render the message as a single wire line (without the trailing `\n`)
    ///
    /// Format:
    /// - `DOWN;src:<id>`
    /// - `UP;src:<id>`
    /// - `sym:<c>;dur:<ms>;src:<id>`
    pub fn encode(&self, src: &str) -> String {
        match self {
            WireMessage::Down => format!("DOWN;src:{}", src),
            WireMessage::Up => format!("UP;src:{}", src),
            WireMessage::Symbol {
                symbol,
                duration_ms,
            } => format!("sym:{};dur:{};src:{}", symbol, duration_ms, src),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Heartbeat {
    Alive,
    Ack,
}

/// Outcome of decoding one received line
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Decoded {
    Message(WireMessage),
    Heartbeat(Heartbeat),
    /// The line carries our own id and must not be dispatched
    SelfEcho,
    Unknown,
}

/// Decode a received line. `local_id` is this node's own id; lines tagged
/// with it are reported as [`Decoded::SelfEcho`].
pub fn decode(line: &str, local_id: &str) -> Decoded {
    let line = line.trim();

    if line == HEARTBEAT {
        return Decoded::Heartbeat(Heartbeat::Alive);
    }
    if line == HEARTBEAT_ACK {
        return Decoded::Heartbeat(Heartbeat::Ack);
    }

    let mut fields = line.split(';');
    let head = match fields.next() {
        Some(head) if !head.is_empty() => head,
        _ => return Decoded::Unknown,
    };

    let mut duration_ms = 0;
    for field in fields {
        if let Some(src) = field.strip_prefix("src:") {
            if !local_id.is_empty() && src == local_id {
                return Decoded::SelfEcho;
            }
        } else if let Some(dur) = field.strip_prefix("dur:") {
            // A missing or garbled duration decodes as zero
            duration_ms = dur.parse().unwrap_or(0);
        }
    }

    match head {
        "DOWN" => Decoded::Message(WireMessage::Down),
        "UP" => Decoded::Message(WireMessage::Up),
        _ => {
            // Older firmware prefixed relayed symbols with "r_"
            let value = match head
                .strip_prefix("sym:")
                .or_else(|| head.strip_prefix("r_sym:"))
            {
                Some(value) => value,
                None => return Decoded::Unknown,
            };

            match value.chars().next().and_then(Symbol::from_char) {
                Some(symbol) => Decoded::Message(WireMessage::Symbol {
                    symbol,
                    duration_ms,
                }),
                None => Decoded::Unknown,
            }
        }
    }
}
