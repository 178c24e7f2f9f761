//! Connection contracts and the per-engine socket pool.
//!
//! Socket I/O and wire parsing live behind [`Connection`]; this crate ships
//! only the in-memory [`ScriptedConnection`] used by tests and the replay CLI.

mod pool;
mod scripted;

use std::fmt;
use std::io;

pub use pool::{DEFAULT_MAX_IDLE_PER_PEER, SocketPool};
pub use scripted::{ConnectionLog, ScriptedConnection, ScriptedConnector};

use crate::error::DispatchError;
use crate::http::{DownloadRequest, DownloadResponse};

/// Remote end of a connection, the socket-pool key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PeerAddr {
    /// Host name as used in the request URL.
    pub host: String,
    /// TCP port.
    pub port: u16,
}

impl PeerAddr {
    /// Creates a peer address.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for PeerAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// An HTTP connection as seen by the dispatch stage.
///
/// Every method is non-blocking: "nothing yet" is reported as `Ok(None)` for
/// responses and as [`io::ErrorKind::WouldBlock`] for body reads.
pub trait Connection: fmt::Debug {
    /// Identifier stable for the lifetime of the socket.
    fn id(&self) -> u64;

    /// Remote host and port.
    fn peer(&self) -> &PeerAddr;

    /// Writes a request.
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError::Connection`] if the socket is unusable.
    fn send_request(&mut self, request: &DownloadRequest) -> Result<(), DispatchError>;

    /// Returns the next response header block once it has fully arrived.
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError::Connection`] if the peer closed the socket and
    /// [`DispatchError::Protocol`] if the header block is malformed.
    fn receive_response(&mut self) -> Result<Option<DownloadResponse>, DispatchError>;

    /// Reads body bytes. `Ok(0)` means the peer closed the connection.
    ///
    /// # Errors
    ///
    /// [`io::ErrorKind::WouldBlock`] when no bytes are available yet.
    fn read_body(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    /// Returns bytes read past the end of the current body to the connection.
    fn unread(&mut self, data: &[u8]);
}

/// Opens new connections when the pool has none for a peer.
pub trait Connector {
    /// Connects to `peer`.
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError::Connection`] when the peer is unreachable.
    fn connect(&mut self, peer: &PeerAddr) -> Result<Box<dyn Connection>, DispatchError>;
}
