//! Wire format for the DMS lite protocol.
//!
//! Messages exchanged between two devices are flat TLV packets. This crate
//! provides the TLV codec and the typed start-ability request/reply built on
//! top of it.

#![forbid(unsafe_code)]

pub mod tlv;
pub mod messages;

pub use messages::*;
pub use tlv::{TlvError, TlvReader, TlvWriter, MAX_PACKET_SIZE};
