//! # tds-protocol
//!
//! Wire formats of the MS-TDS (Tabular Data Stream) transport layer used by
//! Microsoft SQL Server.
//!
//! This crate provides `no_std` compatible definitions of the two headers a
//! client transport has to speak:
//!
//! - the 8-byte physical packet header that frames every TDS packet, and
//! - the 16-byte SMP (Session Multiplex Protocol) sub-header that MARS uses
//!   to run several logical sessions over one connection.
//!
//! ## Features
//!
//! - `std` (default): Enable standard library support
//!
//! ## Design Philosophy
//!
//! This crate is intentionally IO-agnostic. It contains no networking logic
//! and no buffering policy. `tds-transport` builds the packet pool, the
//! multiplexer and the network driver on top of these types.
//!
//! ## Example
//!
//! ```rust
//! use tds_protocol::{PacketHeader, PacketStatus, PacketType, SmpHeader, SmpType};
//!
//! let header = PacketHeader::new(PacketType::SqlBatch, PacketStatus::END_OF_MESSAGE, 100);
//! let mut raw = [0u8; 8];
//! header.encode_into(&mut raw);
//! assert_eq!(&raw[..4], &[0x01, 0x01, 0x00, 0x64]);
//!
//! let smp = SmpHeader::new(SmpType::Data, 3, 116, 1, 4);
//! assert_eq!(smp.payload_length(), 100);
//! ```

#![cfg_attr(not(feature = "std"), no_std)]
#![warn(missing_docs)]
#![deny(unsafe_code)]

pub mod codec;
pub mod error;
pub mod packet;
pub mod smp;

pub use error::ProtocolError;
pub use packet::{
    DEFAULT_PACKET_SIZE, MAX_PACKET_SIZE, MIN_PACKET_SIZE, PACKET_HEADER_SIZE, PacketHeader,
    PacketStatus, PacketType,
};
pub use smp::{
    SMP_HEADER_SIZE, SMP_MAX_DATA_SIZE, SMP_MIN_DATA_SIZE, SMP_SIGNATURE, SmpHeader, SmpType,
};
