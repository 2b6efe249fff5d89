//! # tds-transport
//!
//! Blocking packet transport for the TDS protocol, with optional MARS
//! session multiplexing.
//!
//! This crate sits between a connected byte stream and the token layer that
//! encodes requests and decodes results. It owns everything about packets:
//!
//! - splitting outgoing messages into packets of the negotiated size,
//! - deferred-length prefixes whose value is only known after the data is
//!   written ([`Session::freeze()`]),
//! - framing inbound bytes into packets and SMP frames,
//! - running several sessions over one socket with per-session flow
//!   control when MARS is enabled,
//! - attention (cancel) signalling from another thread.
//!
//! ## Architecture
//!
//! ```text
//! Session threads ──► WriteStream ──► outbound queue ─┐
//!                                                      ├─ network owner ◄─► Transport
//! Session threads ◄── inbound queue ◄── framer ◄──────┘
//! ```
//!
//! There is no background thread. Whichever session thread needs the
//! network first becomes its owner and services the queues for everyone
//! until its own packet has gone out or arrived; the rest wait on their
//! session's condition variable.
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::net::TcpStream;
//! use std::thread;
//! use tds_protocol::PacketType;
//! use tds_transport::{Connection, TransportConfig};
//!
//! # fn main() -> Result<(), tds_transport::TransportError> {
//! let stream = TcpStream::connect("localhost:1433")?;
//! let conn = Connection::new(stream, TransportConfig::new().mars(true))?;
//!
//! let mut session = conn.open_session()?;
//! let cancel = session.cancel_handle();
//! thread::spawn(move || cancel.cancel());
//!
//! session.set_packet_type(PacketType::SqlBatch);
//! session.put_utf16("WAITFOR DELAY '00:01:00'")?;
//! session.flush(true)?;
//! let reply = session.read_packet()?;
//! # let _ = reply;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![deny(unsafe_code)]

pub mod cancel;
pub mod config;
pub mod connection;
pub mod error;
mod framer;
pub mod hook;
mod mux;
pub mod packet;
pub mod pool;
pub mod session;
mod stream;
pub mod transport;

pub use cancel::CancelHandle;
pub use config::TransportConfig;
pub use connection::Connection;
pub use error::{Result, TransportError};
pub use hook::{DefaultErrorHook, ErrorHook, Operation, TimeoutAction, TimeoutContext};
pub use mux::SessionPhase;
pub use packet::{Packet, PacketView};
pub use pool::PacketPool;
pub use session::Session;
pub use stream::FreezeFrame;
pub use transport::Transport;
