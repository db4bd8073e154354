//! TCP byte source for one server connection
//!
//! Reads whatever the socket has into a reusable buffer and hands the bytes
//! to the session untouched; frame boundaries are the decoder's business.
//! I/O failures surface as [`ConnectionError`] and are never retried here.

use bytes::{Bytes, BytesMut};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, info};

use crate::config::{ClientConfig, ServerConfig};
use crate::error::ConnectionError;
use crate::protocol::{FrameWriter, Hello, Timestamp};

const READ_BUFFER_SIZE: usize = 16 * 1024;
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

pub struct Connection {
    stream: TcpStream,
    peer: SocketAddr,
    writer: FrameWriter,
    buffer: BytesMut,
}

impl Connection {
    pub async fn connect(config: &ServerConfig) -> Result<Self, ConnectionError> {
        let address = format!("{}:{}", config.host, config.port);
        let stream = tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(&address))
            .await
            .map_err(|_| ConnectionError::Timeout)?
            .map_err(|e| ConnectionError::ConnectFailed(format!("{}: {}", address, e)))?;

        stream
            .set_nodelay(true)
            .map_err(|e| ConnectionError::ConnectFailed(e.to_string()))?;
        let peer = stream
            .peer_addr()
            .map_err(|e| ConnectionError::ConnectFailed(e.to_string()))?;

        info!("Connected to {}", peer);
        Ok(Self::from_stream(stream, peer))
    }

    /// Wrap an already connected stream
    pub fn from_stream(stream: TcpStream, peer: SocketAddr) -> Self {
        Self {
            stream,
            peer,
            writer: FrameWriter::new(),
            buffer: BytesMut::with_capacity(READ_BUFFER_SIZE),
        }
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Wait for the next bytes from the server.
    ///
    /// Cancel safe: no bytes are lost if the future is dropped.
    pub async fn read(&mut self) -> Result<Bytes, ConnectionError> {
        self.buffer.clear();
        self.buffer.reserve(READ_BUFFER_SIZE);

        let n = self
            .stream
            .read_buf(&mut self.buffer)
            .await
            .map_err(|e| ConnectionError::ReceiveFailed(e.to_string()))?;
        if n == 0 {
            return Err(ConnectionError::Closed);
        }
        Ok(self.buffer.split().freeze())
    }

    async fn send(&mut self, frame: &[u8]) -> Result<(), ConnectionError> {
        self.stream
            .write_all(frame)
            .await
            .map_err(|e| ConnectionError::SendFailed(e.to_string()))
    }

    pub async fn send_hello(&mut self, client: &ClientConfig) -> Result<(), ConnectionError> {
        let hello = Hello::new(&client.name, &client.id, client.instance);
        let frame = self
            .writer
            .hello(&hello, Timestamp::now())
            .map_err(|e| ConnectionError::SendFailed(e.to_string()))?;
        debug!("Sending hello as {}", client.name);
        self.send(&frame).await
    }

    pub async fn send_time_request(&mut self) -> Result<(), ConnectionError> {
        let frame = self.writer.time_request(Timestamp::now());
        self.send(&frame).await
    }
}
