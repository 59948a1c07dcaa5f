//! Controller side of the loopback TCP transport.

use std::net::SocketAddr;

use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio_util::codec::{FramedRead, FramedWrite};

use crate::error::BridgeError;
use crate::protocol::{Request, Response, WireCodec};

/// One framed connection to a worker. At most one request is in flight.
pub struct Connection {
    peer: SocketAddr,
    reader: FramedRead<OwnedReadHalf, WireCodec<Response>>,
    writer: FramedWrite<OwnedWriteHalf, WireCodec<Request>>,
}

impl Connection {
    pub async fn open(addr: SocketAddr, max_frame_length: usize) -> Result<Self, BridgeError> {
        let stream = TcpStream::connect(addr)
            .await
            .map_err(BridgeError::Transport)?;
        stream.set_nodelay(true).map_err(BridgeError::Transport)?;
        let (read_half, write_half) = stream.into_split();
        tracing::trace!(%addr, "Connected to worker");
        Ok(Self {
            peer: addr,
            reader: FramedRead::new(
                read_half,
                WireCodec::with_max_frame_length(max_frame_length),
            ),
            writer: FramedWrite::new(
                write_half,
                WireCodec::with_max_frame_length(max_frame_length),
            ),
        })
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Send one request and wait for its response.
    pub async fn round_trip(&mut self, request: Request) -> Result<Response, BridgeError> {
        self.writer.send(request).await?;
        match self.reader.next().await {
            Some(Ok(response)) => Ok(response),
            Some(Err(e)) => Err(e.into()),
            None => Err(BridgeError::transport("worker closed the connection")),
        }
    }
}
