//! Client-side connection: one TCP stream, request/response with
//! correlation ids and per-call timeouts.
//!
//! A `Connection` issues one call at a time; callers that need concurrency
//! hold a pool of connections. On any transport error the connection is
//! poisoned and the caller reconnects — there is no in-place recovery.

use std::marker::PhantomData;
use std::time::Duration;

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use rangestream_core::{Error, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::net::TcpStream;
use tokio_util::codec::Framed;
use tracing::debug;

use crate::codec::FrameCodec;
use crate::{RequestFrame, ResponseFrame};

pub struct Connection<Req, Resp> {
    framed: Framed<TcpStream, FrameCodec>,
    peer: String,
    next_correlation_id: u64,
    _marker: PhantomData<fn(Req) -> Resp>,
}

impl<Req, Resp> Connection<Req, Resp>
where
    Req: Serialize,
    Resp: DeserializeOwned,
{
    /// Connect to `addr` within `timeout`.
    pub async fn connect(addr: &str, timeout: Duration) -> Result<Self> {
        let stream = tokio::time::timeout(timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| Error::Unavailable(format!("connect to {addr} timed out")))?
            .map_err(|e| Error::Unavailable(format!("connect to {addr}: {e}")))?;
        let _ = stream.set_nodelay(true);

        debug!(peer = addr, "connected");

        Ok(Self {
            framed: Framed::new(stream, FrameCodec::new()),
            peer: addr.to_string(),
            next_correlation_id: 0,
            _marker: PhantomData,
        })
    }

    /// Issue a request and await its response.
    ///
    /// Transport failures surface as `Unavailable`; application errors come
    /// back typed through the response envelope.
    pub async fn call(&mut self, request: Req, timeout: Duration) -> Result<Resp> {
        let correlation_id = self.next_correlation_id;
        self.next_correlation_id += 1;

        let frame = RequestFrame {
            correlation_id,
            request,
        };
        let encoded = bincode::serialize(&frame)
            .map_err(|e| Error::Protocol(format!("encode request: {e}")))?;

        self.framed
            .send(Bytes::from(encoded))
            .await
            .map_err(|e| Error::Unavailable(format!("send to {}: {e}", self.peer)))?;

        let payload = match tokio::time::timeout(timeout, self.framed.next()).await {
            Err(_) => {
                return Err(Error::Unavailable(format!(
                    "request to {} timed out",
                    self.peer
                )))
            }
            Ok(None) => {
                return Err(Error::Unavailable(format!(
                    "connection to {} closed",
                    self.peer
                )))
            }
            Ok(Some(Err(e))) => {
                return Err(Error::Unavailable(format!(
                    "receive from {}: {e}",
                    self.peer
                )))
            }
            Ok(Some(Ok(payload))) => payload,
        };

        let response: ResponseFrame<Resp> = bincode::deserialize(&payload)
            .map_err(|e| Error::Protocol(format!("decode response from {}: {e}", self.peer)))?;

        if response.correlation_id != correlation_id {
            return Err(Error::Protocol(format!(
                "correlation mismatch from {}: sent {}, got {}",
                self.peer, correlation_id, response.correlation_id
            )));
        }

        response.result
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }
}
