//! Channels to servers and the sources that produce them.
//!
//! A [`Channel`] is a reference-counted handle to one open connection; a [`ChannelSource`]
//! is a reference-counted factory yielding channels for a specific, already-selected
//! server. Both follow the fork/dispose discipline: every concurrently-running logical
//! sub-operation works through its own forked handle, and the underlying resource is
//! released when the last handle is disposed.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use bson::{Bson, Document};
use futures_core::future::BoxFuture;

use crate::{
    context::OperationContext,
    error::Result,
    handle::{Disposable, RefCountedHandle},
    session::SessionHandle,
    topology::{Server, ServerAddress, ServerDescription},
};

/// A driver-side command about to be sent to a server.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct Command {
    /// The name of the command.
    pub name: String,

    /// The database against which the command is issued.
    pub target_db: String,

    /// The command body.
    pub body: Document,
}

impl Command {
    /// Constructs a new command.
    pub fn new(
        name: impl Into<String>,
        target_db: impl Into<String>,
        body: Document,
    ) -> Self {
        Self {
            name: name.into(),
            target_db: target_db.into(),
            body,
        }
    }

    /// Whether commands with this name may carry a session id.
    pub(crate) fn supports_sessions(&self) -> bool {
        !crate::session::SESSIONS_UNSUPPORTED_COMMANDS.contains(self.name.to_lowercase().as_str())
    }

    pub(crate) fn set_session_id(&mut self, id: Document) {
        self.body.insert("lsid", id);
    }

    pub(crate) fn set_cluster_time(&mut self, cluster_time: &crate::session::ClusterTime) {
        if let Ok(Bson::Document(doc)) = bson::to_bson(cluster_time) {
            self.body.insert("$clusterTime", doc);
        }
    }

    pub(crate) fn set_txn_number(&mut self, txn_number: i64) {
        self.body.insert("txnNumber", txn_number);
    }

    pub(crate) fn set_statement_id(&mut self, statement_id: i64) {
        self.body.insert("stmtId", statement_id);
    }

    pub(crate) fn set_start_transaction(&mut self) {
        self.body.insert("startTransaction", true);
    }

    pub(crate) fn set_autocommit(&mut self) {
        self.body.insert("autocommit", false);
    }

    /// Set `readConcern.afterClusterTime` for a causally consistent read.
    pub(crate) fn set_after_cluster_time(&mut self, operation_time: bson::Timestamp) {
        let read_concern = match self.body.get_document_mut("readConcern") {
            Ok(doc) => doc,
            Err(_) => {
                self.body.insert("readConcern", Document::new());
                self.body.get_document_mut("readConcern").unwrap()
            }
        };
        read_concern.insert("afterClusterTime", Bson::Timestamp(operation_time));
    }
}

/// The wire collaborator: one open, possibly multiplexed connection to a server.
///
/// Implementations live outside this crate (the connection pool and wire codec); this core
/// only sends command documents and reads response documents through them.
pub trait Connection: Send + Sync + 'static {
    /// The address this connection is open to.
    fn address(&self) -> ServerAddress;

    /// Whether this connection is known to be unusable (closed by the server, poisoned by
    /// an abandoned in-flight call, or timed out).
    fn is_expired(&self) -> bool;

    /// Sends a command and reads its response document.
    fn command<'a>(
        &'a self,
        ctx: &'a OperationContext,
        command: Command,
    ) -> BoxFuture<'a, Result<Document>>;

    /// Physically closes the connection (or returns it to its pool).
    fn close(&self);
}

struct ChannelState {
    connection: Box<dyn Connection>,
    description: ServerDescription,
    /// Set when an in-flight call was abandoned at a deadline; responses on the wire can no
    /// longer be matched to requests after that.
    abandoned: AtomicBool,
}

impl Disposable for ChannelState {
    const NAME: &'static str = "Channel";

    fn dispose(&self) {
        self.connection.close();
    }
}

/// A reference-counted handle to one open channel.
#[derive(Debug)]
pub struct Channel {
    handle: RefCountedHandle<ChannelState>,
}

impl Channel {
    /// Wraps a freshly checked-out connection.
    pub fn new(connection: Box<dyn Connection>, description: ServerDescription) -> Self {
        Self {
            handle: RefCountedHandle::new(ChannelState {
                connection,
                description,
                abandoned: AtomicBool::new(false),
            }),
        }
    }

    /// Returns a new handle to the same channel, incrementing its reference count.
    pub fn fork(&self) -> Result<Channel> {
        Ok(Channel {
            handle: self.handle.fork()?,
        })
    }

    /// Releases this handle's reference; the connection is closed when the last handle is
    /// disposed.
    pub fn dispose(&self) {
        self.handle.dispose();
    }

    /// The description of the server this channel is open to, captured at checkout.
    pub fn description(&self) -> Result<ServerDescription> {
        Ok(self.handle.get()?.description.clone())
    }

    /// The address this channel is open to.
    pub fn address(&self) -> Result<ServerAddress> {
        Ok(self.handle.get()?.connection.address())
    }

    /// Whether the underlying connection is known to be unusable. A disposed handle counts
    /// as expired, as does a channel whose in-flight call was abandoned at a deadline.
    pub fn is_expired(&self) -> bool {
        match self.handle.get() {
            Ok(state) => {
                state.abandoned.load(Ordering::Acquire) || state.connection.is_expired()
            }
            Err(_) => true,
        }
    }

    /// Sends a command over this channel and reads the raw response document.
    ///
    /// If the context's deadline passes first, the in-flight call is abandoned, a timeout
    /// error is returned, and the channel is treated as expired from then on.
    pub async fn command(&self, ctx: &OperationContext, command: Command) -> Result<Document> {
        let state = self.handle.get()?;
        match ctx.run_until(state.connection.command(ctx, command)).await {
            Ok(result) => result,
            Err(timeout) => {
                state.abandoned.store(true, Ordering::Release);
                Err(timeout)
            }
        }
    }
}

enum ChannelSourceKind {
    /// Checks a fresh channel out of the server for every request.
    Server(Arc<dyn Server>),

    /// Pinned to one already-open channel; every request forks it.
    Channel(Channel),
}

struct ChannelSourceState {
    kind: ChannelSourceKind,
    description: ServerDescription,
    session: SessionHandle,
}

impl Disposable for ChannelSourceState {
    const NAME: &'static str = "ChannelSource";

    fn dispose(&self) {
        if let ChannelSourceKind::Channel(ref channel) = self.kind {
            channel.dispose();
        }
        self.session.dispose();
    }
}

/// A reference-counted factory yielding channels to one already-selected server.
///
/// The source owns a fork of the session that operations through it must use, and releases
/// that fork when the last handle is disposed.
#[derive(Debug)]
pub struct ChannelSource {
    handle: RefCountedHandle<ChannelSourceState>,
}

impl ChannelSource {
    /// A source that checks a channel out of `server` on every call.
    pub fn server(server: Arc<dyn Server>, session: SessionHandle) -> Self {
        let description = server.description();
        Self {
            handle: RefCountedHandle::new(ChannelSourceState {
                kind: ChannelSourceKind::Server(server),
                description,
                session,
            }),
        }
    }

    /// A source pinned to one already-open channel. Takes ownership of the given channel
    /// handle.
    pub fn channel(channel: Channel, session: SessionHandle) -> Result<Self> {
        let description = channel.description()?;
        Ok(Self {
            handle: RefCountedHandle::new(ChannelSourceState {
                kind: ChannelSourceKind::Channel(channel),
                description,
                session,
            }),
        })
    }

    /// Returns a new handle to the same source, incrementing its reference count.
    pub fn fork(&self) -> Result<ChannelSource> {
        Ok(ChannelSource {
            handle: self.handle.fork()?,
        })
    }

    /// Releases this handle's reference; the session fork (and pinned channel, if any) are
    /// released when the last handle is disposed.
    pub fn dispose(&self) {
        self.handle.dispose();
    }

    /// The description of the server this source targets.
    pub fn server_description(&self) -> Result<ServerDescription> {
        Ok(self.handle.get()?.description.clone())
    }

    /// The session operations through this source must use.
    pub fn session(&self) -> Result<&SessionHandle> {
        Ok(&self.handle.get()?.session)
    }

    /// Yields a channel to the source's server: checked out fresh for server-backed
    /// sources, forked for pinned ones.
    pub async fn channel(&self, ctx: &OperationContext) -> Result<Channel> {
        let state = self.handle.get()?;
        match state.kind {
            ChannelSourceKind::Server(ref server) => server.checkout(ctx).await,
            ChannelSourceKind::Channel(ref channel) => channel.fork(),
        }
    }
}

#[cfg(test)]
mod test {
    use std::time::Duration;

    use bson::doc;

    use super::*;
    use crate::{
        test::MockConnection,
        topology::{test_util::server_description, ServerType},
    };

    fn test_channel(connection: &Arc<MockConnection>) -> Channel {
        Channel::new(
            Box::new(connection.clone()),
            server_description("a:27017", ServerType::RsPrimary),
        )
    }

    #[tokio::test]
    async fn deadline_abandons_the_call_and_expires_the_channel() {
        let connection = MockConnection::new("a:27017");
        connection.hang();
        let channel = test_channel(&connection);
        assert!(!channel.is_expired());

        let ctx = OperationContext::new(Duration::from_millis(10));
        let error = channel
            .command(&ctx, Command::new("ping", "admin", doc! { "ping": 1 }))
            .await
            .unwrap_err();
        assert!(error.is_network_timeout());
        assert!(channel.is_expired());
    }

    #[tokio::test]
    async fn forks_share_the_connection_until_the_last_dispose() {
        let connection = MockConnection::new("a:27017");
        let channel = test_channel(&connection);
        let fork = channel.fork().unwrap();

        channel.dispose();
        assert_eq!(connection.close_count(), 0);
        assert!(channel.fork().unwrap_err().is_disposed());

        fork.dispose();
        assert_eq!(connection.close_count(), 1);
        fork.dispose();
        assert_eq!(connection.close_count(), 1);
    }

    #[tokio::test]
    async fn session_commands_are_marked() {
        let command = Command::new("killCursors", "db", doc! { "killCursors": "coll" });
        assert!(!command.supports_sessions());
        let command = Command::new("getMore", "db", doc! { "getMore": 1i64 });
        assert!(command.supports_sessions());
    }
}
