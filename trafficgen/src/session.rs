//! Opening sessions against a remote agent.
//!
//! trafficgen does not speak any particular session protocol. A
//! [`Connector`] is handed an [`OpenRequest`] and returns an already-open
//! duplex stream; everything after that is bytes.

use std::io;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::{
    io::{AsyncRead, AsyncWrite, AsyncWriteExt},
    net::TcpStream,
};
use tracing::debug;
use uuid::Uuid;

/// Command run in the remote terminal.
pub const DEFAULT_COMMAND: &str = "/bin/sh";

/// Size of the remote terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dimensions {
    /// Rows
    pub height: u16,
    /// Columns
    pub width: u16,
}

impl Dimensions {
    /// The largest terminal the protocol can describe. Keeps the remote side
    /// from wrapping or truncating generated input.
    pub const MAX: Self = Self {
        height: u16::MAX,
        width: u16::MAX,
    };
}

/// Everything a [`Connector`] needs to open one session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpenRequest {
    /// The remote agent
    pub target_id: Uuid,
    /// Identifies this session should it be reconnected
    pub reconnect: Uuid,
    /// Terminal size
    #[serde(flatten)]
    pub dimensions: Dimensions,
    /// Command started in the terminal
    pub command: String,
}

impl OpenRequest {
    /// A request for `target_id` with a fresh reconnect identifier, the
    /// largest terminal and the default command.
    #[must_use]
    pub fn new(target_id: Uuid) -> Self {
        Self {
            target_id,
            reconnect: Uuid::new_v4(),
            dimensions: Dimensions::MAX,
            command: String::from(DEFAULT_COMMAND),
        }
    }
}

#[async_trait]
/// Opens session streams.
pub trait Connector {
    /// The duplex stream of an open session
    type Stream: AsyncRead + AsyncWrite + Unpin + Send + 'static;

    /// Open one session.
    async fn open(&self, request: &OpenRequest) -> io::Result<Self::Stream>;
}

#[derive(Debug, Clone)]
/// Opens sessions over plain TCP.
///
/// The open request is sent as a single line of JSON, after which the
/// connection carries session traffic.
pub struct TcpConnector {
    addr: String,
}

impl TcpConnector {
    /// Create a connector for `addr`.
    #[must_use]
    pub fn new(addr: impl Into<String>) -> Self {
        Self { addr: addr.into() }
    }
}

#[async_trait]
impl Connector for TcpConnector {
    type Stream = TcpStream;

    async fn open(&self, request: &OpenRequest) -> io::Result<TcpStream> {
        let mut stream = TcpStream::connect(&self.addr).await?;
        stream.set_nodelay(true)?;

        let mut header = serde_json::to_vec(request)?;
        header.push(b'\n');
        stream.write_all(&header).await?;
        debug!(addr = %self.addr, reconnect = %request.reconnect, "session opened");

        Ok(stream)
    }
}
