//! Logical sessions and the pool that recycles their server-side identities.

mod cluster_time;
mod pool;

use std::{
    collections::HashSet,
    sync::{Arc, LazyLock, Mutex},
    time::{Duration, Instant},
};

use bson::{doc, spec::BinarySubtype, Binary, Bson, Document, Timestamp};
use uuid::Uuid;

pub use cluster_time::ClusterTime;
pub use pool::ServerSessionPool;

use crate::{
    error::{Error, ErrorKind, Result},
    handle::{Disposable, RefCountedHandle},
    options::{SessionOptions, TransactionOptions},
};

/// Commands that may never carry a session id.
pub(crate) static SESSIONS_UNSUPPORTED_COMMANDS: LazyLock<HashSet<&'static str>> =
    LazyLock::new(|| {
        let mut hash_set = HashSet::new();
        hash_set.insert("killcursors");
        hash_set
    });

/// How close to its server-side expiry a session may get before it is discarded rather
/// than reused. Fixed rather than derived from the timeout itself.
const ABOUT_TO_EXPIRE_MARGIN: Duration = Duration::from_secs(60);

/// Client side abstraction of a server session. These are pooled and may be associated with
/// multiple logical sessions over the course of their lifetime.
#[derive(Clone, Debug)]
pub(crate) struct ServerSession {
    /// The id of the server session to which this corresponds.
    pub(crate) id: Document,

    /// The last time an operation was executed with this session.
    last_use: Instant,

    /// Whether a network error was encountered while using this session.
    pub(crate) dirty: bool,

    /// A monotonically increasing transaction number for this session.
    txn_number: i64,
}

impl ServerSession {
    /// Creates a new session, generating the id client side.
    fn new() -> Self {
        let binary = Bson::Binary(Binary {
            subtype: BinarySubtype::Uuid,
            bytes: Uuid::new_v4().as_bytes().to_vec(),
        });

        Self {
            id: doc! { "id": binary },
            last_use: Instant::now(),
            dirty: false,
            txn_number: 0,
        }
    }

    /// Determines if this server session is about to expire within the safety margin.
    /// Sessions on deployments that report no timeout are always considered expired.
    fn is_about_to_expire(&self, logical_session_timeout: Option<Duration>) -> bool {
        let timeout = match logical_session_timeout {
            Some(timeout) => timeout,
            None => return true,
        };
        let expiration_date = self.last_use + timeout;
        expiration_date < Instant::now() + ABOUT_TO_EXPIRE_MARGIN
    }
}

/// The state of a transaction nested in a session.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[non_exhaustive]
pub enum TransactionState {
    /// No transaction is in flight.
    None,

    /// The transaction has started but no command has been sent under it yet.
    Starting,

    /// At least one command has been sent under the transaction.
    InProgress,

    /// The transaction has been committed.
    Committed {
        /// Whether any command had run under the transaction when it was first committed.
        /// A commit of an empty transaction has nothing to re-send on a retried commit.
        data_committed: bool,
    },

    /// The transaction has been aborted.
    Aborted,
}

/// A transaction's driver-side bookkeeping: its state, the transaction number it occupies
/// on the server session, a monotonically advancing statement id, and its options.
#[derive(Clone, Debug)]
pub(crate) struct Transaction {
    pub(crate) state: TransactionState,
    pub(crate) number: i64,
    statement_id: i64,
    pub(crate) options: Option<TransactionOptions>,
}

impl Transaction {
    fn start(&mut self, number: i64, options: Option<TransactionOptions>) {
        self.state = TransactionState::Starting;
        self.number = number;
        self.statement_id = 0;
        self.options = options;
    }

    fn reset(&mut self) {
        self.state = TransactionState::None;
        self.number = 0;
        self.statement_id = 0;
        self.options = None;
    }
}

impl Default for Transaction {
    fn default() -> Self {
        Self {
            state: TransactionState::None,
            number: 0,
            statement_id: 0,
            options: None,
        }
    }
}

/// The shared state of a logical session: its server session, clocks, and transaction.
///
/// Owned exclusively by the binding that acquired it until forked; forks share this state
/// through the reference-counted [`SessionHandle`].
pub struct CoreSession {
    pool: Arc<ServerSessionPool>,
    logical_session_timeout: Option<Duration>,
    is_implicit: bool,
    causal_consistency: bool,
    options: SessionOptions,
    inner: Mutex<SessionInner>,
}

struct SessionInner {
    /// `None` only after disposal has released the server session back to the pool.
    server_session: Option<ServerSession>,
    cluster_time: Option<ClusterTime>,
    operation_time: Option<Timestamp>,
    transaction: Transaction,
}

impl Disposable for CoreSession {
    const NAME: &'static str = "CoreSession";

    fn dispose(&self) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(mut server_session) = inner.server_session.take() {
            if matches!(
                inner.transaction.state,
                TransactionState::Starting | TransactionState::InProgress
            ) {
                // The caller abandoned an open transaction; the server session cannot be
                // reused until the server times the transaction out, so discard it.
                tracing::warn!("session disposed with an open transaction");
                server_session.dirty = true;
            }
            self.pool
                .check_in(server_session, self.logical_session_timeout);
        }
    }
}

/// A reference-counted handle to a logical session.
///
/// Bindings and channel sources fork the handle so that each concurrently-running logical
/// sub-operation holds its own disposable reference; the server session is released back to
/// the pool when the last handle is disposed.
#[derive(Debug)]
pub struct SessionHandle {
    handle: RefCountedHandle<CoreSession>,
}

impl SessionHandle {
    /// Acquires a session from the pool.
    ///
    /// `logical_session_timeout` is the deployment's timeout at acquisition time and
    /// governs both the pool checkout and the eventual checkin.
    pub fn acquire(
        pool: Arc<ServerSessionPool>,
        logical_session_timeout: Option<Duration>,
        options: SessionOptions,
        is_implicit: bool,
    ) -> Self {
        let server_session = pool.check_out(logical_session_timeout);
        let causal_consistency = options.causal_consistency.unwrap_or(!is_implicit);
        Self {
            handle: RefCountedHandle::new(CoreSession {
                pool,
                logical_session_timeout,
                is_implicit,
                causal_consistency,
                options,
                inner: Mutex::new(SessionInner {
                    server_session: Some(server_session),
                    cluster_time: None,
                    operation_time: None,
                    transaction: Transaction::default(),
                }),
            }),
        }
    }

    /// Returns a new handle sharing this session, incrementing its reference count.
    pub fn fork(&self) -> Result<SessionHandle> {
        Ok(SessionHandle {
            handle: self.handle.fork()?,
        })
    }

    /// Releases this handle's reference. The server session returns to the pool once every
    /// handle has been disposed.
    pub fn dispose(&self) {
        self.handle.dispose();
    }

    /// Whether `other` refers to the same underlying session.
    pub fn same_session(&self, other: &SessionHandle) -> bool {
        self.handle.same_resource(&other.handle)
    }

    fn with_server_session<R>(&self, f: impl FnOnce(&mut ServerSession) -> R) -> Result<R> {
        let session = self.handle.get()?;
        let mut inner = session.inner.lock().unwrap();
        let server_session = inner
            .server_session
            .as_mut()
            .ok_or_else(|| Error::disposed(CoreSession::NAME))?;
        Ok(f(server_session))
    }

    /// The id of this session.
    pub fn id(&self) -> Result<Document> {
        self.with_server_session(|s| s.id.clone())
    }

    /// Whether this session was created implicitly by the driver rather than by the user.
    pub fn is_implicit(&self) -> Result<bool> {
        Ok(self.handle.get()?.is_implicit)
    }

    /// Whether operations on this session are causally consistent.
    pub fn is_causally_consistent(&self) -> Result<bool> {
        Ok(self.handle.get()?.causal_consistency)
    }

    /// The highest cluster time this session has seen so far, if any.
    pub fn cluster_time(&self) -> Result<Option<ClusterTime>> {
        let session = self.handle.get()?;
        let inner = session.inner.lock().unwrap();
        Ok(inner.cluster_time.clone())
    }

    /// The latest operation time this session has seen, if any.
    pub fn operation_time(&self) -> Result<Option<Timestamp>> {
        let session = self.handle.get()?;
        let inner = session.inner.lock().unwrap();
        Ok(inner.operation_time)
    }

    /// Set the cluster time to the provided one if it is greater than this session's
    /// highest seen cluster time or if this session has none. Never regresses.
    pub fn advance_cluster_time(&self, to: &ClusterTime) -> Result<()> {
        let session = self.handle.get()?;
        let mut inner = session.inner.lock().unwrap();
        if inner.cluster_time.as_ref().map(|ct| ct < to).unwrap_or(true) {
            inner.cluster_time = Some(to.clone());
        }
        Ok(())
    }

    /// Set the operation time to the provided one if it is more recent than this session's
    /// highest seen operation time. Never regresses.
    pub fn advance_operation_time(&self, to: Timestamp) -> Result<()> {
        let session = self.handle.get()?;
        let mut inner = session.inner.lock().unwrap();
        if inner.operation_time.map(|ot| ot < to).unwrap_or(true) {
            inner.operation_time = Some(to);
        }
        Ok(())
    }

    /// Mark the underlying server session as dirty; it will be discarded rather than pooled
    /// on release.
    pub(crate) fn mark_dirty(&self) {
        let _ = self.with_server_session(|s| s.dirty = true);
    }

    #[cfg(test)]
    pub(crate) fn is_dirty(&self) -> Result<bool> {
        self.with_server_session(|s| s.dirty)
    }

    /// Updates the time the underlying server session was last used. Called on every
    /// command sent with this session attached.
    pub(crate) fn update_last_use(&self) {
        let _ = self.with_server_session(|s| s.last_use = Instant::now());
    }

    /// Increments the server session's transaction number and returns the new value.
    pub(crate) fn next_txn_number(&self) -> Result<i64> {
        self.with_server_session(|s| {
            s.txn_number += 1;
            s.txn_number
        })
    }

    /// Whether this session is currently inside a multi-statement transaction.
    pub fn in_transaction(&self) -> Result<bool> {
        Ok(matches!(
            self.transaction_state()?,
            TransactionState::Starting | TransactionState::InProgress
        ))
    }

    /// The state of this session's current transaction.
    pub fn transaction_state(&self) -> Result<TransactionState> {
        let session = self.handle.get()?;
        let inner = session.inner.lock().unwrap();
        Ok(inner.transaction.state)
    }

    /// The transaction number of the current transaction.
    pub(crate) fn txn_number(&self) -> Result<i64> {
        let session = self.handle.get()?;
        let inner = session.inner.lock().unwrap();
        Ok(inner.transaction.number)
    }

    /// The options the current transaction was started with.
    pub fn transaction_options(&self) -> Result<Option<TransactionOptions>> {
        let session = self.handle.get()?;
        let inner = session.inner.lock().unwrap();
        Ok(inner.transaction.options.clone())
    }

    /// Advances the per-transaction statement id and returns the value the next statement
    /// should carry.
    pub(crate) fn next_statement_id(&self) -> Result<i64> {
        let session = self.handle.get()?;
        let mut inner = session.inner.lock().unwrap();
        let id = inner.transaction.statement_id;
        inner.transaction.statement_id += 1;
        Ok(id)
    }

    /// Starts a new transaction on this session.
    ///
    /// Fails if a transaction is already in flight or if the effective write concern is
    /// unacknowledged.
    pub fn start_transaction(
        &self,
        options: impl Into<Option<TransactionOptions>>,
    ) -> Result<()> {
        let session = self.handle.get()?;
        let mut options = options.into();
        if let Some(defaults) = session.options.default_transaction_options.as_ref() {
            match options {
                Some(ref mut options) => options.merge(defaults),
                None => options = Some(defaults.clone()),
            }
        }
        if let Some(wc) = options.as_ref().and_then(|o| o.write_concern.as_ref()) {
            if !wc.is_acknowledged() {
                return Err(ErrorKind::Transaction {
                    message: "transactions do not support unacknowledged write concerns"
                        .to_string(),
                }
                .into());
            }
        }

        let mut inner = session.inner.lock().unwrap();
        match inner.transaction.state {
            TransactionState::Starting | TransactionState::InProgress => {
                return Err(ErrorKind::Transaction {
                    message: "transaction already in progress".to_string(),
                }
                .into());
            }
            _ => {}
        }
        let number = {
            let server_session = inner
                .server_session
                .as_mut()
                .ok_or_else(|| Error::disposed(CoreSession::NAME))?;
            server_session.txn_number += 1;
            server_session.txn_number
        };
        inner.transaction.start(number, options);
        Ok(())
    }

    /// Records the first command of the transaction having been sent.
    pub(crate) fn transaction_started(&self) {
        if let Ok(session) = self.handle.get() {
            let mut inner = session.inner.lock().unwrap();
            if inner.transaction.state == TransactionState::Starting {
                inner.transaction.state = TransactionState::InProgress;
            }
        }
    }

    /// Transitions the current transaction to `Committed`, validating the transition.
    ///
    /// Returns whether a `commitTransaction` command must be run against the server: a
    /// commit of a transaction under which no command ever ran needs no network round trip.
    pub fn commit_transaction(&self) -> Result<bool> {
        let session = self.handle.get()?;
        let mut inner = session.inner.lock().unwrap();
        match inner.transaction.state {
            TransactionState::None => Err(ErrorKind::Transaction {
                message: "no transaction started".to_string(),
            }
            .into()),
            TransactionState::Aborted => Err(ErrorKind::Transaction {
                message: "cannot commit a transaction after aborting it".to_string(),
            }
            .into()),
            TransactionState::Starting => {
                inner.transaction.state = TransactionState::Committed {
                    data_committed: false,
                };
                Ok(false)
            }
            TransactionState::InProgress => {
                inner.transaction.state = TransactionState::Committed {
                    data_committed: true,
                };
                Ok(true)
            }
            // Committing again re-runs the commit command when data was committed.
            TransactionState::Committed { data_committed } => Ok(data_committed),
        }
    }

    /// Transitions the current transaction to `Aborted`, validating the transition.
    ///
    /// Returns whether an `abortTransaction` command must be run against the server.
    pub fn abort_transaction(&self) -> Result<bool> {
        let session = self.handle.get()?;
        let mut inner = session.inner.lock().unwrap();
        match inner.transaction.state {
            TransactionState::None => Err(ErrorKind::Transaction {
                message: "no transaction started".to_string(),
            }
            .into()),
            TransactionState::Committed { .. } => Err(ErrorKind::Transaction {
                message: "cannot abort a transaction after committing it".to_string(),
            }
            .into()),
            TransactionState::Aborted => Err(ErrorKind::Transaction {
                message: "cannot abort a transaction twice".to_string(),
            }
            .into()),
            TransactionState::Starting => {
                inner.transaction.state = TransactionState::Aborted;
                Ok(false)
            }
            TransactionState::InProgress => {
                inner.transaction.state = TransactionState::Aborted;
                Ok(true)
            }
        }
    }

    /// Clears a finished (committed or aborted) transaction so the session can be reused.
    pub fn reset_transaction(&self) -> Result<()> {
        let session = self.handle.get()?;
        let mut inner = session.inner.lock().unwrap();
        match inner.transaction.state {
            TransactionState::Committed { .. } | TransactionState::Aborted => {
                inner.transaction.reset();
                Ok(())
            }
            TransactionState::None => Ok(()),
            _ => Err(ErrorKind::Transaction {
                message: "cannot reset a transaction that is in progress".to_string(),
            }
            .into()),
        }
    }
}
