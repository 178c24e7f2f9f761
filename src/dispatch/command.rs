//! The command that waits for a response and dispatches it.

use std::sync::Arc;

use tracing::{debug, info, instrument, trace};

use super::init::{effective_total_length, finalize_context};
use super::resume::{SegmentDecision, StartDecision, decide_segment, decide_start};
use super::{DispatchPlan, EncodingPath, RedirectPlan, classify};
use crate::engine::{Attempt, Command, Cuid, Engine};
use crate::error::DispatchError;
use crate::group::{GroupId, RequestGroup};
use crate::http::{DownloadRequest, DownloadResponse};
use crate::net::Connection;
use crate::registry::DownloadRegistry;
use crate::storage::Segment;
use crate::transfer::{TransferCommand, TransferDecoder, resolve_decoder};

/// Follow-on work decided while the request group is borrowed.
enum Next {
    /// HEAD request answered; no body follows.
    HeadAnswered,
    /// The destination already holds the whole entity.
    AlreadyComplete,
    /// Stream the body on this connection.
    Transfer {
        decoder: Option<TransferDecoder>,
        segment: Option<Segment>,
    },
    /// Drop the connection and start over with a fresh attempt.
    FreshAttempt,
}

/// Waits for the response to a sent request and acts on it.
#[derive(Debug)]
pub struct ResponseCommand {
    cuid: Cuid,
    group: GroupId,
    request: DownloadRequest,
    connection: Box<dyn Connection>,
}

impl ResponseCommand {
    /// Creates the command for `request`, already sent on `connection`.
    #[must_use]
    pub fn new(
        cuid: Cuid,
        group: GroupId,
        request: DownloadRequest,
        connection: Box<dyn Connection>,
    ) -> Self {
        Self {
            cuid,
            group,
            request,
            connection,
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

    /// The request this command waits on.
    #[must_use]
    pub fn request(&self) -> &DownloadRequest {
        &self.request
    }

    /// Identifier of the connection the response arrives on.
    #[must_use]
    pub fn connection_id(&self) -> u64 {
        self.connection.id()
    }

    /// Dispatches the response once it has arrived.
    ///
    /// Returns `Ok(false)` after re-enqueueing itself while no response is
    /// available, `Ok(true)` once the follow-on work (if any) is scheduled.
    /// Follow-on commands are built only after every check has passed.
    ///
    /// # Errors
    ///
    /// - [`DispatchError::HttpStatus`] / [`DispatchError::Protocol`] for an
    ///   invalid response.
    /// - [`DispatchError::TooManyRedirects`] past the redirect limit.
    /// - [`DispatchError::DuplicateDownload`] when another download owns the
    ///   destination.
    /// - [`DispatchError::UnsupportedEncoding`] for an undecodable body.
    /// - [`DispatchError::LengthMismatch`] when a continued download changed size.
    /// - [`DispatchError::TooManyPieces`] for an entity too large to track.
    ///
    /// A failure while initializing a fresh download rolls the group back, so
    /// a later attempt starts from the next response.
    #[instrument(skip_all, fields(cuid = %self.cuid, group = %self.group, url = %self.request.url()))]
    pub fn execute(mut self, engine: &mut Engine) -> Result<bool, DispatchError> {
        let response = self.connection.receive_response()?;
        let has_piece_storage = engine.group(self.group)?.has_piece_storage();
        let plan = classify(&self.request, response.as_ref(), has_piece_storage)?;
        let (plan, response) = match (plan, response) {
            (DispatchPlan::Pending, _) | (_, None) => {
                trace!("response not yet available");
                engine.enqueue(Command::Response(self));
                return Ok(false);
            }
            (plan, Some(response)) => (plan, response),
        };
        debug!(status = response.status().as_u16(), plan = ?plan, "response classified");

        let group = engine.group_mut(self.group)?;
        group.store_cookies(&response);

        if let DispatchPlan::Redirect(redirect) = plan {
            return self.follow_redirect(engine, redirect, &response);
        }

        if !group.is_single_host_multi_connection_enabled() {
            group.remove_uris_for_hostname(self.request.host());
        }

        let registry = Arc::clone(engine.registry());
        let group = engine.group_mut(self.group)?;
        let next = match plan {
            DispatchPlan::Initialize(path) => {
                self.initialize(group, &registry, path, &response)?
            }
            DispatchPlan::ContinueExisting => self.continue_existing(group, &response)?,
            DispatchPlan::Pending | DispatchPlan::Redirect(_) => return Ok(true),
        };
        self.schedule(engine, next, &response)
    }

    fn follow_redirect(
        self,
        engine: &mut Engine,
        redirect: RedirectPlan,
        response: &DownloadResponse,
    ) -> Result<bool, DispatchError> {
        let max_redirects = engine.group(self.group)?.options().max_redirects;
        match redirect {
            RedirectPlan::DrainThenFollow { target } => {
                let next = self.request.redirected(&target, max_redirects)?;
                let decoder = resolve_decoder(response)?;
                info!(target = %target, "redirect with body, draining before follow");
                engine.enqueue(Command::Transfer(TransferCommand::drain(
                    self.cuid,
                    self.group,
                    self.request,
                    self.connection,
                    decoder,
                    response.content_length(),
                    next,
                )));
            }
            RedirectPlan::PoolAndRetry { target } => {
                let next = self.request.redirected(&target, max_redirects)?;
                if self.request.supports_persistent_connection() {
                    let peer = self.connection.peer().clone();
                    engine.pool_mut().pool(&peer.host, peer.port, self.connection);
                }
                info!(target = %target, "redirect, restarting attempt");
                engine.enqueue(Command::Attempt(Attempt::new(self.cuid, self.group, next)));
            }
        }
        Ok(true)
    }

    fn initialize(
        &self,
        group: &mut RequestGroup,
        registry: &DownloadRegistry,
        path: EncodingPath,
        response: &DownloadResponse,
    ) -> Result<Next, DispatchError> {
        let result = finalize_context(group, response).and_then(|_| {
            group.pre_download_processing()?;
            claim_destination(group, registry)?;
            match path {
                EncodingPath::Other => self.other_encoding(group, registry, response),
                EncodingPath::Default => self.default_encoding(group, registry),
            }
        });
        if result.is_err() {
            group.reset_initialization();
        }
        result
    }

    fn other_encoding(
        &self,
        group: &mut RequestGroup,
        registry: &DownloadRegistry,
        response: &DownloadResponse,
    ) -> Result<Next, DispatchError> {
        if self.request.is_head() {
            return Ok(Next::HeadAnswered);
        }
        let decoder = resolve_decoder(response)?;
        group.init_piece_storage()?;
        group.should_cancel_download_for_safety()?;
        claim_destination(group, registry)?;
        group.open_stream_file()?;
        debug!(decoder = ?decoder.as_ref().map(TransferDecoder::name), "streaming unseekable body");
        Ok(Next::Transfer {
            decoder,
            segment: None,
        })
    }

    fn default_encoding(
        &self,
        group: &mut RequestGroup,
        registry: &DownloadRegistry,
    ) -> Result<Next, DispatchError> {
        if self.request.is_head() {
            return Ok(Next::HeadAnswered);
        }
        group.init_piece_storage()?;

        let snapshot = group
            .progress_snapshot()
            .cloned()
            .ok_or_else(|| DispatchError::protocol(self.request.url().as_str(), "destination not resolved"))?;
        let snapshot_exists = snapshot.exists();
        let satisfied = !snapshot_exists && group.download_already_satisfies_target_length();
        if decide_start(snapshot_exists, satisfied) == StartDecision::AlreadyComplete {
            return Ok(Next::AlreadyComplete);
        }

        group.load_and_open_file(&snapshot)?;
        claim_destination(group, registry)?;

        let Some(segments) = group.segment_manager_mut() else {
            return Ok(Next::FreshAttempt);
        };
        let segment = segments.get_segment(self.cuid, 0);
        match decide_segment(segment.as_ref(), self.request.is_pipelining_enabled()) {
            SegmentDecision::ContinueOnConnection(segment) => Ok(Next::Transfer {
                decoder: None,
                segment: Some(segment),
            }),
            SegmentDecision::ReleaseAndRetry => {
                segments.cancel_segment(self.cuid);
                Ok(Next::FreshAttempt)
            }
        }
    }

    fn continue_existing(
        &self,
        group: &mut RequestGroup,
        response: &DownloadResponse,
    ) -> Result<Next, DispatchError> {
        group.validate_total_length(effective_total_length(response))?;
        if self.request.is_head() {
            return Ok(Next::HeadAnswered);
        }
        let decoder = resolve_decoder(response)?;

        let Some(segments) = group.segment_manager_mut() else {
            return Ok(Next::Transfer {
                decoder,
                segment: None,
            });
        };
        let expected = self.request.range_start().unwrap_or(0);
        match segments.get_segment(self.cuid, 0) {
            Some(segment) if segment.position_to_write() == expected => Ok(Next::Transfer {
                decoder,
                segment: Some(segment),
            }),
            _ => {
                segments.cancel_segment(self.cuid);
                Ok(Next::FreshAttempt)
            }
        }
    }

    fn schedule(
        self,
        engine: &mut Engine,
        next: Next,
        response: &DownloadResponse,
    ) -> Result<bool, DispatchError> {
        match next {
            Next::HeadAnswered => {
                if self.request.supports_persistent_connection() {
                    let peer = self.connection.peer().clone();
                    engine.pool_mut().pool(&peer.host, peer.port, self.connection);
                }
                engine.group_mut(self.group)?.mark_complete();
                engine.registry().release(self.group);
            }
            Next::AlreadyComplete => {
                info!("destination already complete, nothing to transfer");
                engine.group_mut(self.group)?.finish_download()?;
                engine.registry().release(self.group);
            }
            Next::Transfer { decoder, segment } => {
                let content_length = if decoder.is_some() {
                    None
                } else {
                    response.content_length()
                };
                engine.enqueue(Command::Transfer(TransferCommand::download(
                    self.cuid,
                    self.group,
                    self.request,
                    self.connection,
                    decoder,
                    content_length,
                    segment,
                )));
            }
            Next::FreshAttempt => {
                debug!("body on this connection does not fit the segment, starting fresh attempt");
                let request = self.request.without_range();
                engine.enqueue(Command::Attempt(Attempt::new(self.cuid, self.group, request)));
            }
        }
        Ok(true)
    }
}

fn claim_destination(group: &RequestGroup, registry: &DownloadRegistry) -> Result<(), DispatchError> {
    match group.file_path() {
        Some(path) => registry.claim(group.id(), path),
        None => Ok(()),
    }
}
