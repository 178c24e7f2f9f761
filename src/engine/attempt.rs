//! Fresh-attempt command: acquire a connection and send the request.

use tracing::{debug, instrument};

use super::{Command, Cuid, Engine};
use crate::dispatch::ResponseCommand;
use crate::error::DispatchError;
use crate::group::GroupId;
use crate::http::DownloadRequest;
use crate::net::PeerAddr;

/// Sends one request of a download on a pooled or new connection.
#[derive(Debug)]
pub struct Attempt {
    cuid: Cuid,
    group: GroupId,
    request: DownloadRequest,
}

impl Attempt {
    /// Creates an attempt for `request`.
    #[must_use]
    pub fn new(cuid: Cuid, group: GroupId, request: DownloadRequest) -> Self {
        Self {
            cuid,
            group,
            request,
        }
    }

    /// Worker identity.
    #[must_use]
    pub fn cuid(&self) -> Cuid {
        self.cuid
    }

    /// Owning download.
    #[must_use]
    pub fn group(&self) -> GroupId {
        self.group
    }

    /// The request to send.
    #[must_use]
    pub fn request(&self) -> &DownloadRequest {
        &self.request
    }

    /// Sends the request and enqueues a [`ResponseCommand`] for its answer.
    ///
    /// A download with segment state first takes a segment for this worker
    /// and asks for the entity from its write cursor. Without a segment left
    /// the worker retires, finishing the download if nothing is missing.
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError::Connection`] if no connection can be opened
    /// or the request cannot be sent.
    #[instrument(skip_all, fields(cuid = %self.cuid, group = %self.group, url = %self.request.url()))]
    pub fn execute(self, engine: &mut Engine) -> Result<bool, DispatchError> {
        let Self {
            cuid,
            group: group_id,
            mut request,
        } = self;

        let group = engine.group_mut(group_id)?;
        if let Some(segments) = group.segment_manager_mut() {
            match segments.get_segment(cuid, 0) {
                Some(segment) => request = request.for_segment(segment.position_to_write()),
                None => {
                    debug!("no segment left for this worker");
                    if group.is_download_complete() {
                        group.finish_download()?;
                        engine.registry().release(group_id);
                    }
                    return Ok(true);
                }
            }
        }

        let (host, port) = (request.host().to_string(), request.port());
        let mut connection = match engine.pool_mut().take(&host, port) {
            Some(connection) => connection,
            None => engine
                .connector_mut()
                .connect(&PeerAddr::new(host, port))?,
        };
        connection.send_request(&request)?;
        debug!(
            connection = connection.id(),
            range_start = ?request.range_start(),
            "request sent"
        );
        engine.enqueue(Command::Response(ResponseCommand::new(
            cuid, group_id, request, connection,
        )));
        Ok(true)
    }
}
