//! Wire protocol for RangeStream.
//!
//! All RangeStream traffic — client to placement driver, client to range
//! server, range server to range server, and PD peer to PD peer — uses the
//! same transport: length-prefixed frames over TCP, with bincode-encoded
//! message bodies.
//!
//! Frame format:
//! ```text
//! +------------------+------------------+
//! | Length (4 bytes) | Payload          |
//! +------------------+------------------+
//! ```
//!
//! The payload is a [`RequestFrame`] or [`ResponseFrame`] envelope carrying
//! a correlation id, so responses can be matched to requests. The message
//! vocabularies live in [`pd`] (placement driver surface, including PD peer
//! consensus messages) and [`rs`] (range server surface).

pub mod codec;
pub mod connection;
pub mod pd;
pub mod rs;

pub use codec::FrameCodec;
pub use connection::Connection;

use rangestream_core::Result;
use serde::{Deserialize, Serialize};

/// A request envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestFrame<R> {
    pub correlation_id: u64,
    pub request: R,
}

/// A response envelope. The result carries the cluster error taxonomy
/// verbatim, so typed errors survive the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseFrame<R> {
    pub correlation_id: u64,
    pub result: Result<R>,
}
