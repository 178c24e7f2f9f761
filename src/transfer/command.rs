//! The command that streams a response body off its connection.
//!
//! One type covers both uses of a body: downloading it into the destination
//! and draining a redirect body so the connection can be reused.

use std::borrow::Cow;
use std::io;
use std::time::{Duration, Instant};

use tracing::{debug, info, instrument, trace};

use super::TransferDecoder;
use crate::config::DownloadOptions;
use crate::engine::{Attempt, Command, Cuid, Engine};
use crate::error::DispatchError;
use crate::group::GroupId;
use crate::http::DownloadRequest;
use crate::net::Connection;
use crate::storage::{Segment, SegmentManager};

/// Bytes read from the connection per scheduler tick.
const BUFFER_SIZE: usize = 16 * 1024;

/// What happens to the body bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferMode {
    /// Write the body into the destination.
    Download,
    /// Discard the body, then send `next` on the same connection.
    Drain {
        /// Request for the redirect target.
        next: DownloadRequest,
    },
}

#[derive(Debug, Clone, Copy)]
struct SpeedLimits {
    max: u64,
    lowest: u64,
    startup_idle_time: Duration,
}

impl From<&DownloadOptions> for SpeedLimits {
    fn from(options: &DownloadOptions) -> Self {
        Self {
            max: options.max_download_limit,
            lowest: options.lowest_speed_limit,
            startup_idle_time: options.startup_idle_time,
        }
    }
}

/// Streams a response body under an optional transfer decoder.
///
/// Each [`execute`](Self::execute) reads at most one buffer and re-enqueues
/// the command until the body is complete. Identity bodies of declared
/// length are never read past their end; bytes a decoder does not consume
/// go back to the connection.
#[derive(Debug)]
pub struct TransferCommand {
    cuid: Cuid,
    group: GroupId,
    request: DownloadRequest,
    connection: Box<dyn Connection>,
    decoder: Option<TransferDecoder>,
    mode: TransferMode,
    remaining: Option<u64>,
    segmented: bool,
    segment: Option<Segment>,
    stream_offset: u64,
    received: u64,
    started: Instant,
}

impl TransferCommand {
    /// Creates a command that writes the body into the destination.
    ///
    /// With a `segment` the body is written at its write cursor and then into
    /// the following contiguous segments; without one it is written as a
    /// single stream from offset 0.
    #[must_use]
    pub fn download(
        cuid: Cuid,
        group: GroupId,
        request: DownloadRequest,
        connection: Box<dyn Connection>,
        decoder: Option<TransferDecoder>,
        content_length: Option<u64>,
        segment: Option<Segment>,
    ) -> Self {
        Self {
            cuid,
            group,
            request,
            connection,
            decoder,
            mode: TransferMode::Download,
            remaining: content_length,
            segmented: segment.is_some(),
            segment,
            stream_offset: 0,
            received: 0,
            started: Instant::now(),
        }
    }

    /// Creates a command that drains a redirect body, then follows `next`.
    #[must_use]
    pub fn drain(
        cuid: Cuid,
        group: GroupId,
        request: DownloadRequest,
        connection: Box<dyn Connection>,
        decoder: Option<TransferDecoder>,
        content_length: Option<u64>,
        next: DownloadRequest,
    ) -> Self {
        Self {
            mode: TransferMode::Drain { next },
            ..Self::download(cuid, group, request, connection, decoder, content_length, None)
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

    /// Download or drain.
    #[must_use]
    pub fn mode(&self) -> &TransferMode {
        &self.mode
    }

    /// Attached transfer decoder.
    #[must_use]
    pub fn decoder(&self) -> Option<&TransferDecoder> {
        self.decoder.as_ref()
    }

    /// Segment currently being written.
    #[must_use]
    pub fn segment(&self) -> Option<&Segment> {
        self.segment.as_ref()
    }

    /// Identifier of the connection the body arrives on.
    #[must_use]
    pub fn connection_id(&self) -> u64 {
        self.connection.id()
    }

    /// Reads and handles one buffer of body bytes.
    ///
    /// Returns `Ok(false)` after re-enqueueing itself while the body is
    /// incomplete.
    ///
    /// # Errors
    ///
    /// - [`DispatchError::Connection`] if the peer closes a framed body early.
    /// - [`DispatchError::Protocol`] for malformed chunked framing.
    /// - [`DispatchError::TooSlow`] below the lowest speed limit.
    /// - [`DispatchError::Io`] if the destination cannot be written.
    #[instrument(skip_all, fields(cuid = %self.cuid, group = %self.group, url = %self.request.url()))]
    pub fn execute(mut self, engine: &mut Engine) -> Result<bool, DispatchError> {
        if self.is_body_complete() {
            return self.finish(engine);
        }

        if self.mode == TransferMode::Download {
            let limits = SpeedLimits::from(engine.group(self.group)?.options());
            if self.throttled(limits)? {
                engine.enqueue(Command::Transfer(self));
                return Ok(false);
            }
        }

        let mut buf = [0u8; BUFFER_SIZE];
        let want = match (&self.decoder, self.remaining) {
            (None, Some(remaining)) => {
                usize::try_from(remaining).map_or(BUFFER_SIZE, |r| r.min(BUFFER_SIZE))
            }
            _ => BUFFER_SIZE,
        };
        match self.connection.read_body(&mut buf[..want]) {
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                trace!("body bytes not yet available");
                engine.enqueue(Command::Transfer(self));
                Ok(false)
            }
            Err(err) => Err(self.connection_error(err)),
            Ok(0) => self.on_closed(engine),
            Ok(n) => {
                self.on_bytes(engine, &buf[..n])?;
                if self.segmented && self.segment.is_none() && !self.is_body_complete() {
                    debug!("no contiguous segment left, abandoning rest of body");
                    let Self {
                        cuid,
                        group,
                        request,
                        ..
                    } = self;
                    return conclude_download(engine, cuid, group, request);
                }
                if self.is_body_complete() {
                    self.finish(engine)
                } else {
                    engine.enqueue(Command::Transfer(self));
                    Ok(false)
                }
            }
        }
    }

    fn is_body_complete(&self) -> bool {
        match &self.decoder {
            Some(decoder) => decoder.is_finished(),
            None => self.remaining == Some(0),
        }
    }

    fn throttled(&self, limits: SpeedLimits) -> Result<bool, DispatchError> {
        let elapsed = self.started.elapsed();
        let elapsed_ms = u64::try_from(elapsed.as_millis())
            .unwrap_or(u64::MAX)
            .max(1);
        let bytes_per_sec = self.received.saturating_mul(1000) / elapsed_ms;
        if limits.lowest > 0 && elapsed >= limits.startup_idle_time && bytes_per_sec < limits.lowest
        {
            return Err(DispatchError::TooSlow {
                url: self.request.url().to_string(),
                bytes_per_sec,
                limit: limits.lowest,
            });
        }
        Ok(limits.max > 0 && bytes_per_sec > limits.max)
    }

    fn on_bytes(&mut self, engine: &mut Engine, data: &[u8]) -> Result<(), DispatchError> {
        self.received += data.len() as u64;
        let payload: Cow<'_, [u8]> = match self.decoder.as_mut() {
            Some(decoder) => {
                let mut out = Vec::with_capacity(data.len());
                let consumed = decoder.feed(data, &mut out).map_err(|err| {
                    DispatchError::protocol(self.request.url().as_str(), err.to_string())
                })?;
                if consumed < data.len() {
                    self.connection.unread(&data[consumed..]);
                }
                Cow::Owned(out)
            }
            None => {
                if let Some(remaining) = self.remaining.as_mut() {
                    *remaining = remaining.saturating_sub(data.len() as u64);
                }
                Cow::Borrowed(data)
            }
        };

        if let TransferMode::Drain { .. } = self.mode {
            trace!(discarded = payload.len(), "draining redirect body");
            return Ok(());
        }
        self.store(engine, &payload)
    }

    fn store(&mut self, engine: &mut Engine, mut data: &[u8]) -> Result<(), DispatchError> {
        let group = engine.group_mut(self.group)?;
        if !self.segmented {
            group.write_stream(self.stream_offset, data)?;
            self.stream_offset += data.len() as u64;
            return Ok(());
        }

        let cuid = self.cuid;
        while !data.is_empty() {
            let Some(segment) = self.segment.as_mut() else {
                trace!(dropped = data.len(), "body bytes beyond last contiguous segment");
                break;
            };
            let take = usize::try_from(segment.remaining()).map_or(data.len(), |r| r.min(data.len()));
            group.write_segment(segment, &data[..take])?;
            data = &data[take..];
            if !segment.is_complete() {
                continue;
            }
            let index = segment.index;
            let end = segment.offset + segment.length;
            self.segment = group.segment_manager_mut().and_then(|segments| {
                segments.cancel_segment(cuid);
                segments.claim_at(cuid, end)
            });
            group.save_progress()?;
            debug!(index, next = ?self.segment.map(|s| s.index), "segment finished");
        }
        Ok(())
    }

    fn on_closed(self, engine: &mut Engine) -> Result<bool, DispatchError> {
        let unframed = self.decoder.is_none() && self.remaining.is_none();
        if !unframed {
            return Err(self.connection_error(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "connection closed before body was complete",
            )));
        }
        debug!(received = self.received, "body ended by connection close");
        let Self {
            cuid,
            group,
            request,
            mode,
            ..
        } = self;
        match mode {
            TransferMode::Drain { next } => {
                engine.enqueue(Command::Attempt(Attempt::new(cuid, group, next)));
                Ok(true)
            }
            TransferMode::Download => conclude_download(engine, cuid, group, request),
        }
    }

    fn finish(self, engine: &mut Engine) -> Result<bool, DispatchError> {
        let Self {
            cuid,
            group,
            request,
            connection,
            mode,
            ..
        } = self;
        match mode {
            TransferMode::Drain { next } => {
                let peer = connection.peer().clone();
                engine.pool_mut().pool(&peer.host, peer.port, connection);
                info!(target = %next.url(), "redirect body drained, following");
                engine.enqueue(Command::Attempt(Attempt::new(cuid, group, next)));
                Ok(true)
            }
            TransferMode::Download => {
                if request.supports_persistent_connection() {
                    let peer = connection.peer().clone();
                    engine.pool_mut().pool(&peer.host, peer.port, connection);
                }
                conclude_download(engine, cuid, group, request)
            }
        }
    }

    fn connection_error(&self, source: io::Error) -> DispatchError {
        let peer = self.connection.peer();
        DispatchError::connection(peer.host.clone(), peer.port, source)
    }
}

/// Settles the download after a worker's body ended.
///
/// A segmented download with pieces left schedules a fresh attempt for
/// them; a complete one is finished and its destination claim released.
fn conclude_download(
    engine: &mut Engine,
    cuid: Cuid,
    group_id: GroupId,
    request: DownloadRequest,
) -> Result<bool, DispatchError> {
    let group = engine.group_mut(group_id)?;
    let segmented = match group.segment_manager_mut() {
        Some(segments) => {
            segments.cancel_segment(cuid);
            true
        }
        None => false,
    };

    if segmented && !group.is_download_complete() {
        group.save_progress()?;
        let more = group
            .segment_manager()
            .is_some_and(SegmentManager::has_unassigned_work);
        if more {
            debug!(%cuid, "pieces left, scheduling fresh attempt");
            engine.enqueue(Command::Attempt(Attempt::new(
                cuid,
                group_id,
                request.without_range(),
            )));
        }
        return Ok(true);
    }

    group.finish_download()?;
    engine.registry().release(group_id);
    Ok(true)
}
