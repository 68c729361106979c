//! Streaming query results via the cursor protocol.
//!
//! A [`Cursor`] is created with the first batch of results already in hand (by the
//! operation that opened it) and a cursor id naming the server side result set; iterating
//! past the in-memory batch drives `getMore` round trips through the cursor's exclusively
//! owned channel source. Closing the cursor (or dropping it) releases the server side
//! resources with a best-effort `killCursors`.


use std::{collections::VecDeque, time::Duration};

use bson::{Bson, Document};
use typed_builder::TypedBuilder;

use crate::{
    channel::ChannelSource,
    context::OperationContext,
    error::{Error, ErrorKind, Result},
    executor::execute_on_channel,
    operation::{GetMore, KillCursors},
    runtime,
    Namespace,
};

/// How long a best-effort `killCursors` is allowed to take.
const KILL_CURSORS_TIMEOUT: Duration = Duration::from_secs(10);

/// Specification used to create a new cursor, produced by the operation that opened it.
#[derive(Clone, Debug, TypedBuilder)]
#[non_exhaustive]
pub struct CursorSpecification {
    /// The namespace the cursor iterates.
    pub ns: Namespace,

    /// The server side cursor id; `0` means the first batch is the entire result set.
    pub id: i64,

    /// The documents returned alongside the cursor id.
    pub first_batch: VecDeque<Document>,

    /// The number of documents to request per `getMore`.
    #[builder(default, setter(into))]
    pub batch_size: Option<i32>,

    /// The maximum total number of documents to yield.
    #[builder(default, setter(into))]
    pub limit: Option<i64>,

    /// The server side time limit for each `getMore`.
    #[builder(default, setter(into))]
    pub max_time: Option<Duration>,

    /// A comment attached to each `getMore`, where the server supports it.
    #[builder(default, setter(into))]
    pub comment: Option<Bson>,
}

#[derive(Clone, Debug)]
struct CursorInformation {
    ns: Namespace,
    batch_size: Option<i32>,
    limit: Option<i64>,
    max_time: Option<Duration>,
    comment: Option<Bson>,
}

/// A paged handle onto a server side result set.
///
/// The channel source passed at construction is exclusively owned by the cursor and is
/// disposed as soon as no server side resource remains: immediately for an already
/// exhausted cursor, after the `getMore` that returns cursor id `0`, or on close.
#[derive(Debug)]
pub struct Cursor {
    info: CursorInformation,
    /// `Some` exactly while the server may still hold resources for this cursor.
    source: Option<ChannelSource>,
    cursor_id: i64,
    buffer: VecDeque<Document>,
    /// Documents received so far, bounded by `limit`.
    count: i64,
    closed: bool,
}

impl Cursor {
    /// Creates a cursor over `spec`, taking ownership of `source`.
    pub fn new(spec: CursorSpecification, source: ChannelSource) -> Self {
        let mut buffer = spec.first_batch;
        if let Some(limit) = spec.limit {
            if limit > 0 && buffer.len() as i64 > limit {
                buffer.truncate(limit as usize);
            }
        }
        let count = buffer.len() as i64;

        let source = if spec.id == 0 {
            // No server side cursor exists, so nothing will ever need the source.
            source.dispose();
            None
        } else {
            Some(source)
        };

        Self {
            info: CursorInformation {
                ns: spec.ns,
                batch_size: spec.batch_size,
                limit: spec.limit,
                max_time: spec.max_time,
                comment: spec.comment,
            },
            source,
            cursor_id: spec.id,
            buffer,
            count,
            closed: false,
        }
    }

    /// The current server side cursor id; `0` once the result set is exhausted.
    pub fn id(&self) -> i64 {
        self.cursor_id
    }

    /// The namespace this cursor iterates.
    pub fn namespace(&self) -> &Namespace {
        &self.info.ns
    }

    /// Whether no further documents remain, locally or on the server.
    pub fn is_exhausted(&self) -> bool {
        self.buffer.is_empty() && (self.cursor_id == 0 || self.limit_reached())
    }

    fn limit_reached(&self) -> bool {
        matches!(self.info.limit, Some(limit) if limit > 0 && self.count >= limit)
    }

    /// Retrieves the next document, fetching another batch from the server if the local
    /// buffer is exhausted and the cursor is still alive. Returns `Ok(None)` once no
    /// documents remain.
    pub async fn next(&mut self, ctx: &OperationContext) -> Result<Option<Document>> {
        if self.closed {
            return Err(Error::disposed("Cursor"));
        }
        loop {
            if let Some(doc) = self.buffer.pop_front() {
                return Ok(Some(doc));
            }
            if self.cursor_id == 0 || self.limit_reached() {
                return Ok(None);
            }
            self.fetch_batch(ctx).await?;
        }
    }

    /// Issues one `getMore` using the same session the cursor was opened with.
    async fn fetch_batch(&mut self, ctx: &OperationContext) -> Result<()> {
        let source = self
            .source
            .as_ref()
            .ok_or_else(|| Error::internal("cursor has a live id but no channel source"))?;

        // Channel acquisition failures surface unchanged.
        let channel = source.channel(ctx).await?;
        let mut op = GetMore::new(
            self.info.ns.clone(),
            self.cursor_id,
            self.effective_batch_size(),
            self.info.max_time,
            self.info.comment.clone(),
        );
        let result = execute_on_channel(&mut op, &channel, source.session()?, ctx, None).await;
        channel.dispose();

        let batch = match result {
            Ok(result) => result,
            Err(error) => {
                // An errored cursor is done: no further fetches, and no killCursors, since
                // either the server already reclaimed it or the channel is unusable.
                let stale_id = self.cursor_id;
                self.cursor_id = 0;
                self.dispose_source();
                let error = if matches!(*error.kind, ErrorKind::Command(_))
                    && error.is_cursor_not_found()
                {
                    ErrorKind::CursorNotFound {
                        cursor_id: stale_id,
                    }
                    .into()
                } else {
                    error
                };
                return Err(error);
            }
        };

        self.cursor_id = batch.id;
        let mut documents = batch.batch;
        self.count += documents.len() as i64;
        if let Some(limit) = self.info.limit {
            if limit > 0 && self.count > limit {
                let excess = (self.count - limit) as usize;
                documents.truncate(documents.len() - excess);
                self.count = limit;
            }
        }
        self.buffer = documents;

        if self.cursor_id == 0 {
            self.dispose_source();
        }
        Ok(())
    }

    /// The `batchSize` the next `getMore` should carry: the configured batch size, clamped
    /// so a limit is never overshot. `None` omits the field entirely.
    fn effective_batch_size(&self) -> Option<i32> {
        let batch_size = self.info.batch_size.unwrap_or(0);
        match self.info.limit {
            Some(limit) if limit > 0 => {
                let remaining = limit - self.count;
                let clamped = if batch_size == 0 || i64::from(batch_size) > remaining {
                    remaining as i32
                } else {
                    batch_size
                };
                Some(clamped)
            }
            _ if batch_size > 0 => Some(batch_size),
            _ => None,
        }
    }

    fn dispose_source(&mut self) {
        if let Some(source) = self.source.take() {
            source.dispose();
        }
    }

    /// Closes the cursor, sending a best-effort `killCursors` if a server side cursor
    /// remains and the channel is not already known to be expired.
    ///
    /// Idempotent; `killCursors` failures never surface, but the channel source is
    /// disposed regardless.
    pub async fn close(&mut self, ctx: &OperationContext) {
        if self.closed {
            return;
        }
        self.closed = true;

        if self.cursor_id != 0 {
            if let Some(source) = self.source.take() {
                kill_cursor(
                    source,
                    self.info.ns.clone(),
                    self.cursor_id,
                    ctx.with_timeout(KILL_CURSORS_TIMEOUT),
                )
                .await;
            }
            self.cursor_id = 0;
        }
        self.dispose_source();
        self.buffer.clear();
    }
}

impl Drop for Cursor {
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        if self.cursor_id != 0 {
            if let Some(source) = self.source.take() {
                let ns = self.info.ns.clone();
                let cursor_id = self.cursor_id;
                runtime::spawn(async move {
                    kill_cursor(
                        source,
                        ns,
                        cursor_id,
                        OperationContext::new(KILL_CURSORS_TIMEOUT),
                    )
                    .await;
                });
            }
        }
        self.dispose_source();
    }
}

/// Best-effort cleanup of one server side cursor. Consumes (and disposes) the source;
/// every failure is swallowed after logging.
async fn kill_cursor(source: ChannelSource, ns: Namespace, cursor_id: i64, ctx: OperationContext) {
    let result = async {
        let channel = source.channel(&ctx).await?;
        // An expired channel implies the server already reclaimed the cursor.
        if !channel.is_expired() {
            let mut op = KillCursors::new(ns, vec![cursor_id]);
            let result = execute_on_channel(&mut op, &channel, source.session()?, &ctx, None).await;
            channel.dispose();
            result?;
        } else {
            channel.dispose();
        }
        Ok::<_, Error>(())
    }
    .await;

    if let Err(error) = result {
        tracing::debug!(cursor_id, error = %error, "ignoring killCursors failure");
    }
    source.dispose();
}
