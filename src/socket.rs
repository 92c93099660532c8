//! # Summary
//!
//! This module abstracts over TCP connections to peer nodes.
//!
//! Currently uses `tokio-util`'s `LinesCodec` on top of `tokio`'s TCP
//! stream, so each frame is one `~`-delimited line. Outbound calls are
//! bounded by a timeout on both the connect and the reply, since a peer
//! that never answers has to look exactly like a peer that is gone.

use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_util::codec::{Framed, LinesCodec, LinesCodecError};

use crate::error::{Error, Result};
use crate::membership::Address;
use crate::message::Message;

/// Longest line we are willing to buffer.
const MAX_LINE: usize = 4096;

/// Line-framed TCP connection to a peer.
pub struct Connection {
    peer: String,
    framed: Framed<TcpStream, LinesCodec>,
}

impl Connection {
    pub fn new(stream: TcpStream) -> Self {
        let peer = stream.peer_addr()
            .map(|addr| addr.to_string())
            .unwrap_or_else(|_| "<unknown>".to_string());
        Connection {
            peer,
            framed: Framed::new(stream, LinesCodec::new_with_max_length(MAX_LINE)),
        }
    }

    /// Opens a connection, giving up after `timeout`.
    pub async fn connect(address: &Address, timeout: Duration) -> Result<Self> {
        let connect = TcpStream::connect((address.host.as_str(), address.port));
        match tokio::time::timeout(timeout, connect).await {
        | Ok(Ok(stream)) => {
            stream.set_nodelay(true).ok();
            Ok(Connection::new(stream))
        }
        | Ok(Err(source)) => Err(Error::Unreachable { addr: address.to_string(), source }),
        | Err(_) => Err(Error::Timeout(address.to_string())),
        }
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    /// Next raw frame, or `None` once the peer has closed the connection.
    pub async fn recv(&mut self) -> Option<std::result::Result<String, LinesCodecError>> {
        self.framed.next().await
    }

    /// Clears the codec's error state so the stream can be read again.
    /// Buffered bytes are kept.
    pub fn resume(self) -> Self {
        let Connection { peer, framed } = self;
        Connection { peer, framed: Framed::from_parts(framed.into_parts()) }
    }

    pub async fn send(&mut self, message: &Message) -> Result<()> {
        trace!("sending {} to {}", message, self.peer);
        let peer = self.peer.clone();
        self.framed
            .send(message.to_string())
            .await
            .map_err(|error| codec_error(peer, error))
    }

    /// Sends `message` and waits at most `timeout` for exactly one reply.
    pub async fn call(&mut self, message: &Message, timeout: Duration) -> Result<Message> {
        let peer = self.peer.clone();
        match tokio::time::timeout(timeout, self.exchange(message)).await {
        | Ok(reply) => reply,
        | Err(_) => Err(Error::Timeout(peer)),
        }
    }

    async fn exchange(&mut self, message: &Message) -> Result<Message> {
        self.send(message).await?;
        match self.framed.next().await {
        | Some(Ok(line)) => line.parse::<Message>(),
        | Some(Err(error)) => Err(codec_error(self.peer.clone(), error)),
        | None => Err(Error::Closed(self.peer.clone())),
        }
    }
}

fn codec_error(peer: String, error: LinesCodecError) -> Error {
    match error {
    | LinesCodecError::Io(source) => Error::Unreachable { addr: peer, source },
    | LinesCodecError::MaxLineLengthExceeded => Error::Parse(format!("oversized line from {}", peer)),
    }
}

/// One-shot request/response: connect, send, await one reply, close.
pub async fn call(address: &Address, message: &Message, timeout: Duration) -> Result<Message> {
    let mut connection = Connection::connect(address, timeout).await?;
    connection.call(message, timeout).await
}
