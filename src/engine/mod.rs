//! Single-threaded cooperative scheduler.
//!
//! The [`Engine`] owns a FIFO of [`Command`]s, the request groups, the socket
//! pool and the connector. A command that cannot make progress re-enqueues
//! itself and returns `Ok(false)`; nothing ever blocks.
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//!
//! use segfetch::{DownloadOptions, DownloadResponse, Engine, ScriptedConnection, ScriptedConnector};
//! use url::Url;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let dir = tempfile::tempdir()?;
//! let url = Url::parse("http://mirror.example/hello.txt")?;
//!
//! let mut connector = ScriptedConnector::new();
//! connector.add(
//!     ScriptedConnection::new("mirror.example", 80)
//!         .response(DownloadResponse::from_parts(200, [("content-length", "5")], url.clone())?)
//!         .body(b"hello".to_vec()),
//! );
//!
//! let mut engine = Engine::new(Box::new(connector));
//! engine.create_group(vec![url], Arc::new(DownloadOptions::with_dir(dir.path())));
//! let report = engine.run();
//! assert_eq!(report.completed.len(), 1);
//! assert_eq!(std::fs::read(dir.path().join("hello.txt"))?, b"hello");
//! # Ok(())
//! # }
//! ```

mod attempt;

use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::sync::Arc;

use tracing::{debug, info, warn};
use url::Url;

pub use attempt::Attempt;

use crate::config::DownloadOptions;
use crate::dispatch::ResponseCommand;
use crate::error::{DispatchError, FailureType, classify_error};
use crate::group::{GroupId, GroupStatus, RequestGroup};
use crate::net::{Connector, SocketPool};
use crate::registry::DownloadRegistry;
use crate::transfer::TransferCommand;

/// Identity of one worker (connection-level unit of work).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Cuid(pub u64);

impl fmt::Display for Cuid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A unit of work on the scheduler queue.
#[derive(Debug)]
pub enum Command {
    /// Acquire a connection and send a request.
    Attempt(Attempt),
    /// Wait for and dispatch a response.
    Response(ResponseCommand),
    /// Stream a response body.
    Transfer(TransferCommand),
}

impl Command {
    /// Runs one step.
    ///
    /// `Ok(true)` means the command is finished and did not re-enqueue
    /// itself; `Ok(false)` means it is back on the queue.
    ///
    /// # Errors
    ///
    /// Returns the fatal [`DispatchError`] of the attempt.
    pub fn execute(self, engine: &mut Engine) -> Result<bool, DispatchError> {
        match self {
            Self::Attempt(command) => command.execute(engine),
            Self::Response(command) => command.execute(engine),
            Self::Transfer(command) => command.execute(engine),
        }
    }

    /// Worker this command belongs to.
    #[must_use]
    pub fn cuid(&self) -> Cuid {
        match self {
            Self::Attempt(command) => command.cuid(),
            Self::Response(command) => command.cuid(),
            Self::Transfer(command) => command.cuid(),
        }
    }

    /// Download this command belongs to.
    #[must_use]
    pub fn group(&self) -> GroupId {
        match self {
            Self::Attempt(command) => command.group(),
            Self::Response(command) => command.group(),
            Self::Transfer(command) => command.group(),
        }
    }

    /// Short name for logs.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Attempt(_) => "attempt",
            Self::Response(_) => "response",
            Self::Transfer(_) => "transfer",
        }
    }
}

/// Outcome of [`Engine::run`].
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RunReport {
    /// Downloads that finished.
    pub completed: Vec<GroupId>,
    /// Downloads that failed, with classification and message.
    pub failed: Vec<(GroupId, FailureType, String)>,
    /// Commands executed.
    pub steps: usize,
}

/// The command scheduler and the state its commands share.
pub struct Engine {
    queue: VecDeque<Command>,
    groups: BTreeMap<GroupId, RequestGroup>,
    pool: SocketPool,
    registry: Arc<DownloadRegistry>,
    connector: Box<dyn Connector>,
    next_cuid: u64,
    next_group: u64,
}

impl fmt::Debug for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Engine")
            .field("queued", &self.queue.len())
            .field("groups", &self.groups.len())
            .field("pooled", &self.pool.len())
            .finish_non_exhaustive()
    }
}

impl Engine {
    /// Creates an engine with a private download registry.
    #[must_use]
    pub fn new(connector: Box<dyn Connector>) -> Self {
        Self::with_registry(connector, Arc::new(DownloadRegistry::new()))
    }

    /// Creates an engine sharing `registry` with other engines of the run.
    #[must_use]
    pub fn with_registry(connector: Box<dyn Connector>, registry: Arc<DownloadRegistry>) -> Self {
        Self {
            queue: VecDeque::new(),
            groups: BTreeMap::new(),
            pool: SocketPool::new(),
            registry,
            connector,
            next_cuid: 1,
            next_group: 1,
        }
    }

    /// Reserves a fresh group identity.
    pub fn allocate_group_id(&mut self) -> GroupId {
        let id = GroupId(self.next_group);
        self.next_group += 1;
        id
    }

    /// Reserves a fresh worker identity.
    pub fn next_cuid(&mut self) -> Cuid {
        let cuid = Cuid(self.next_cuid);
        self.next_cuid += 1;
        cuid
    }

    /// Adds a GET download over candidate `uris`.
    pub fn create_group(&mut self, uris: Vec<Url>, options: Arc<DownloadOptions>) -> GroupId {
        let id = self.allocate_group_id();
        self.add_group(RequestGroup::new(id, uris, options))
    }

    /// Adds a prepared request group.
    pub fn add_group(&mut self, group: RequestGroup) -> GroupId {
        let id = group.id();
        self.next_group = self.next_group.max(id.0 + 1);
        self.groups.insert(id, group);
        id
    }

    /// Enqueues the first attempt of a waiting download.
    ///
    /// # Errors
    ///
    /// - [`DispatchError::UnknownGroup`] for an unknown id.
    /// - [`DispatchError::InvalidUrl`] if the group has no usable URI.
    pub fn start(&mut self, id: GroupId) -> Result<(), DispatchError> {
        let cuid = self.next_cuid();
        let group = self.group_mut(id)?;
        let request = group.next_request()?.ok_or_else(|| {
            DispatchError::invalid_url(format!("download {id} has no candidate URI"))
        })?;
        group.mark_active();
        info!(group = %id, url = %request.url(), "download started");
        self.enqueue(Command::Attempt(Attempt::new(cuid, id, request)));
        Ok(())
    }

    /// Puts `command` at the back of the queue.
    pub fn enqueue(&mut self, command: Command) {
        self.queue.push_back(command);
    }

    /// Runs the command at the front of the queue.
    ///
    /// Returns `None` when the queue is empty. A failed command marks its
    /// download failed; it is not retried.
    pub fn step(&mut self) -> Option<Result<bool, DispatchError>> {
        let command = self.queue.pop_front()?;
        let (cuid, group, kind) = (command.cuid(), command.group(), command.kind());
        let result = command.execute(self);
        if let Err(error) = &result {
            self.record_failure(cuid, group, kind, error);
        }
        Some(result)
    }

    fn record_failure(&mut self, cuid: Cuid, id: GroupId, kind: &str, error: &DispatchError) {
        warn!(
            %cuid,
            group = %id,
            command = kind,
            failure = ?classify_error(error),
            error = %error,
            "download attempt failed"
        );
        if let Some(group) = self.groups.get_mut(&id) {
            if let Some(segments) = group.segment_manager_mut() {
                segments.cancel_segment(cuid);
            }
            if let Err(save_error) = group.save_progress() {
                warn!(group = %id, error = %save_error, "could not save progress");
            }
            group.mark_failed(error);
        }
        self.registry.release(id);
    }

    /// Starts every waiting download and runs until the queue is empty.
    pub fn run(&mut self) -> RunReport {
        let waiting: Vec<GroupId> = self
            .groups
            .values()
            .filter(|group| *group.status() == GroupStatus::Waiting)
            .map(RequestGroup::id)
            .collect();
        for id in waiting {
            if let Err(error) = self.start(id) {
                self.record_failure(Cuid(0), id, "start", &error);
            }
        }

        let mut report = RunReport::default();
        while self.step().is_some() {
            report.steps += 1;
        }

        for group in self.groups.values() {
            match group.status() {
                GroupStatus::Complete => report.completed.push(group.id()),
                GroupStatus::Failed { failure, message } => {
                    report.failed.push((group.id(), *failure, message.clone()));
                }
                GroupStatus::Waiting | GroupStatus::Active => {
                    debug!(group = %group.id(), status = ?group.status(), "download left unfinished");
                }
            }
        }
        info!(
            completed = report.completed.len(),
            failed = report.failed.len(),
            steps = report.steps,
            "engine run finished"
        );
        report
    }

    /// Request group `id`.
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError::UnknownGroup`] for an unknown id.
    pub fn group(&self, id: GroupId) -> Result<&RequestGroup, DispatchError> {
        self.groups.get(&id).ok_or(DispatchError::UnknownGroup(id))
    }

    /// Mutable request group `id`.
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError::UnknownGroup`] for an unknown id.
    pub fn group_mut(&mut self, id: GroupId) -> Result<&mut RequestGroup, DispatchError> {
        self.groups.get_mut(&id).ok_or(DispatchError::UnknownGroup(id))
    }

    /// All request groups, ordered by id.
    pub fn groups(&self) -> impl Iterator<Item = &RequestGroup> {
        self.groups.values()
    }

    /// Idle persistent connections.
    #[must_use]
    pub fn pool(&self) -> &SocketPool {
        &self.pool
    }

    /// Mutable socket pool.
    pub fn pool_mut(&mut self) -> &mut SocketPool {
        &mut self.pool
    }

    /// Destination registry shared by the run.
    #[must_use]
    pub fn registry(&self) -> &Arc<DownloadRegistry> {
        &self.registry
    }

    /// Opens new connections.
    pub fn connector_mut(&mut self) -> &mut dyn Connector {
        self.connector.as_mut()
    }

    /// Commands waiting to run, front first.
    pub fn queued(&self) -> impl Iterator<Item = &Command> {
        self.queue.iter()
    }

    /// Number of queued commands.
    #[must_use]
    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use tempfile::TempDir;

    use super::*;
    use crate::http::DownloadResponse;
    use crate::net::{ScriptedConnection, ScriptedConnector};
    use crate::test_support::url;

    #[test]
    fn test_ids_are_unique() {
        let mut engine = Engine::new(Box::new(ScriptedConnector::new()));
        assert_ne!(engine.next_cuid(), engine.next_cuid());
        let first = engine.allocate_group_id();
        let added = engine.add_group(RequestGroup::new(
            GroupId(first.0 + 5),
            vec![],
            Arc::new(DownloadOptions::default()),
        ));
        assert!(engine.allocate_group_id() > added);
    }

    #[test]
    fn test_start_without_uri_fails() {
        let mut engine = Engine::new(Box::new(ScriptedConnector::new()));
        let id = engine.create_group(vec![], Arc::new(DownloadOptions::default()));
        assert!(matches!(engine.start(id), Err(DispatchError::InvalidUrl { .. })));
    }

    #[test]
    fn test_unknown_group() {
        let engine = Engine::new(Box::new(ScriptedConnector::new()));
        assert!(matches!(
            engine.group(GroupId(42)),
            Err(DispatchError::UnknownGroup(GroupId(42)))
        ));
    }

    #[test]
    fn test_run_records_failure_without_retry() {
        let dir = TempDir::new().unwrap();
        let target = url("http://a.example/missing.bin");
        let mut connector = ScriptedConnector::new();
        connector.add(
            ScriptedConnection::new("a.example", 80)
                .response(DownloadResponse::from_parts(404, [], target.clone()).unwrap()),
        );
        let connects = connector.connect_log();
        let mut engine = Engine::new(Box::new(connector));
        let id = engine.create_group(vec![target], Arc::new(DownloadOptions::with_dir(dir.path())));

        let report = engine.run();
        assert!(report.completed.is_empty());
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].0, id);
        assert_eq!(report.failed[0].1, FailureType::Permanent);
        assert_eq!(connects.borrow().len(), 1);
        assert_eq!(engine.queue_len(), 0);
    }

    #[test]
    fn test_run_downloads_plain_file() {
        let dir = TempDir::new().unwrap();
        let target = url("http://a.example/plain.txt");
        let mut connector = ScriptedConnector::new();
        connector.add(
            ScriptedConnection::new("a.example", 80)
                .pending(2)
                .response(
                    DownloadResponse::from_parts(200, [("content-length", "11")], target.clone())
                        .unwrap(),
                )
                .pending(1)
                .body(b"hello world".to_vec()),
        );
        let mut engine = Engine::new(Box::new(connector));
        let id = engine.create_group(vec![target], Arc::new(DownloadOptions::with_dir(dir.path())));

        let report = engine.run();
        assert_eq!(report.completed, vec![id]);
        assert_eq!(
            std::fs::read(dir.path().join("plain.txt")).unwrap(),
            b"hello world"
        );
        assert!(engine.registry().is_empty());
        assert_eq!(engine.pool().len(), 1);
    }
}
