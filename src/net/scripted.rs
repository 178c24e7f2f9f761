//! In-memory connections that replay a scripted server.

use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::io;
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};

use tracing::trace;

use super::{Connection, Connector, PeerAddr};
use crate::error::DispatchError;
use crate::http::{DownloadRequest, DownloadResponse};

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug)]
enum Inbound {
    /// One poll that finds nothing to read.
    Pending,
    Response(DownloadResponse),
    Body(Vec<u8>),
}

#[derive(Debug, Default)]
struct LogState {
    sent: Vec<DownloadRequest>,
    body_bytes_read: u64,
}

/// Shared record of what happened on a [`ScriptedConnection`].
///
/// Stays readable after the connection itself has moved into the engine.
#[derive(Debug, Clone, Default)]
pub struct ConnectionLog(Rc<RefCell<LogState>>);

impl ConnectionLog {
    /// Requests written to the connection, in order.
    #[must_use]
    pub fn sent_requests(&self) -> Vec<DownloadRequest> {
        self.0.borrow().sent.clone()
    }

    /// Total body bytes handed out by `read_body`.
    #[must_use]
    pub fn body_bytes_read(&self) -> u64 {
        self.0.borrow().body_bytes_read
    }
}

/// A connection whose inbound traffic is scripted up front.
#[derive(Debug)]
pub struct ScriptedConnection {
    id: u64,
    peer: PeerAddr,
    inbound: VecDeque<Inbound>,
    log: ConnectionLog,
}

impl ScriptedConnection {
    /// Creates a connection to `host:port` with nothing scripted.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
            peer: PeerAddr::new(host, port),
            inbound: VecDeque::new(),
            log: ConnectionLog::default(),
        }
    }

    /// Scripts `polls` reads that find nothing available.
    #[must_use]
    pub fn pending(mut self, polls: usize) -> Self {
        self.inbound
            .extend(std::iter::repeat_with(|| Inbound::Pending).take(polls));
        self
    }

    /// Scripts a response header block.
    #[must_use]
    pub fn response(mut self, response: DownloadResponse) -> Self {
        self.inbound.push_back(Inbound::Response(response));
        self
    }

    /// Scripts raw body bytes (already transfer-encoded, if any).
    #[must_use]
    pub fn body(mut self, bytes: impl Into<Vec<u8>>) -> Self {
        let bytes = bytes.into();
        if !bytes.is_empty() {
            self.inbound.push_back(Inbound::Body(bytes));
        }
        self
    }

    /// Handle to this connection's activity log.
    #[must_use]
    pub fn log(&self) -> ConnectionLog {
        self.log.clone()
    }

    fn closed_error(&self) -> DispatchError {
        DispatchError::connection(
            self.peer.host.clone(),
            self.peer.port,
            io::Error::new(io::ErrorKind::UnexpectedEof, "connection closed by peer"),
        )
    }
}

impl Connection for ScriptedConnection {
    fn id(&self) -> u64 {
        self.id
    }

    fn peer(&self) -> &PeerAddr {
        &self.peer
    }

    fn send_request(&mut self, request: &DownloadRequest) -> Result<(), DispatchError> {
        trace!(connection = self.id, url = %request.url(), "scripted request sent");
        self.log.0.borrow_mut().sent.push(request.clone());
        Ok(())
    }

    fn receive_response(&mut self) -> Result<Option<DownloadResponse>, DispatchError> {
        match self.inbound.pop_front() {
            Some(Inbound::Pending) => Ok(None),
            Some(Inbound::Response(response)) => Ok(Some(response)),
            Some(Inbound::Body(_)) => Err(DispatchError::protocol(
                format!("http://{}", self.peer),
                "unread body bytes where a response was expected",
            )),
            None => Err(self.closed_error()),
        }
    }

    fn read_body(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self.inbound.front_mut() {
            Some(Inbound::Pending) => {
                self.inbound.pop_front();
                Err(io::ErrorKind::WouldBlock.into())
            }
            Some(Inbound::Body(bytes)) => {
                let n = bytes.len().min(buf.len());
                buf[..n].copy_from_slice(&bytes[..n]);
                bytes.drain(..n);
                if bytes.is_empty() {
                    self.inbound.pop_front();
                }
                self.log.0.borrow_mut().body_bytes_read += n as u64;
                Ok(n)
            }
            Some(Inbound::Response(_)) | None => Ok(0),
        }
    }

    fn unread(&mut self, data: &[u8]) {
        if data.is_empty() {
            return;
        }
        let mut log = self.log.0.borrow_mut();
        log.body_bytes_read = log.body_bytes_read.saturating_sub(data.len() as u64);
        drop(log);
        self.inbound.push_front(Inbound::Body(data.to_vec()));
    }
}

/// Hands out scripted connections in the order they were added per peer.
#[derive(Debug, Default)]
pub struct ScriptedConnector {
    scripts: HashMap<PeerAddr, VecDeque<ScriptedConnection>>,
    connects: Rc<RefCell<Vec<PeerAddr>>>,
}

impl ScriptedConnector {
    /// Creates a connector with no scripted connections.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a connection to hand out for its peer.
    pub fn add(&mut self, connection: ScriptedConnection) {
        self.scripts
            .entry(connection.peer().clone())
            .or_default()
            .push_back(connection);
    }

    /// Shared list of peers connected to so far.
    #[must_use]
    pub fn connect_log(&self) -> Rc<RefCell<Vec<PeerAddr>>> {
        Rc::clone(&self.connects)
    }
}

impl Connector for ScriptedConnector {
    fn connect(&mut self, peer: &PeerAddr) -> Result<Box<dyn Connection>, DispatchError> {
        self.connects.borrow_mut().push(peer.clone());
        let connection = self
            .scripts
            .get_mut(peer)
            .and_then(VecDeque::pop_front)
            .ok_or_else(|| {
                DispatchError::connection(
                    peer.host.clone(),
                    peer.port,
                    io::Error::new(io::ErrorKind::ConnectionRefused, "no scripted connection"),
                )
            })?;
        Ok(Box::new(connection))
    }
}
