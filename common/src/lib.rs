//! Types shared by every node speaking the Morse link wire protocol.

#![cfg_attr(not(feature = "std"), no_std)]

extern crate alloc;

pub mod wire;

pub use wire::{decode, Decoded, Heartbeat, Symbol, WireMessage, HEARTBEAT, HEARTBEAT_ACK};
