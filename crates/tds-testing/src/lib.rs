//! # tds-testing
//!
//! Test infrastructure for the TDS transport.
//!
//! This crate provides in-process server stand-ins that run on a background
//! thread against one end of a loopback socket pair, so transport tests need
//! neither Docker nor a SQL Server instance.
//!
//! ## Features
//!
//! - Plain TDS peer with pluggable replies ([`PlainPeer`])
//! - MARS peer with configurable window grants and echo ([`SmpPeer`])
//! - Packet recording and message reassembly
//!
//! ## Example
//!
//! ```rust,ignore
//! use tds_testing::{PeerConfig, SmpPeer, socket_pair};
//!
//! let (client, server) = socket_pair()?;
//! let peer = SmpPeer::spawn(server, PeerConfig::default().ack_every(3));
//!
//! // Wrap `client` in a MARS connection and talk to the peer...
//!
//! let report = peer.join()?;
//! assert_eq!(report.total_violations(), 0);
//! ```

#![warn(missing_docs)]

pub mod peer;
pub mod recorder;
pub mod smp_peer;

pub use peer::{
    PeerError, PlainPeer, RawPacket, Result, attention_ack, encode_packet, read_packet,
    socket_pair, split_message,
};
pub use recorder::{Message, PacketRecorder, Reassembler, RecordedPacket, strip_headers};
pub use smp_peer::{PeerConfig, PeerReport, SessionReport, SmpPeer};
