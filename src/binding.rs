//! Bindings map a logical read/write intent to a concrete channel source.
//!
//! A binding composes a topology selector with a session. Each call to
//! [`Binding::read_channel_source`] / [`Binding::write_channel_source`] forks the session
//! (and pinned channel, where applicable) so every logical sub-operation receives its own
//! disposable handle while the binding itself remains usable.

#[cfg(test)]
mod test;

use std::{
    fmt,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use futures_core::future::BoxFuture;
use futures_util::FutureExt;

use crate::{
    channel::{Channel, ChannelSource},
    context::OperationContext,
    error::{Error, Result},
    selection_criteria::{ReadPreference, SelectionCriteria},
    session::SessionHandle,
    topology::{Cluster, Server, ServerAddress},
};

/// A policy object mapping a read/write intent to a channel source via topology selection.
///
/// Constructed once per logical user operation. Disposal releases the binding's session
/// fork (and pinned channel, where owned) but never a cluster or server the binding does
/// not own; every call after disposal fails with a disposed-resource error.
pub struct Binding {
    disposed: AtomicBool,
    kind: BindingKind,
}

enum BindingKind {
    /// Selects a server through the cluster using a read preference. Read-only.
    ReadPreference {
        cluster: Arc<dyn Cluster>,
        read_preference: ReadPreference,
        session: SessionHandle,
    },

    /// Selects a writable server through the cluster. Serves both reads and writes.
    Writable {
        cluster: Arc<dyn Cluster>,
        session: SessionHandle,
    },

    /// Pinned to one already-selected server.
    SingleServer {
        server: Arc<dyn Server>,
        session: SessionHandle,
    },

    /// Pinned to one already-open channel.
    SingleChannel {
        channel: Channel,
        session: SessionHandle,
    },

    /// Delegates reads and writes to two bindings sharing one session.
    Split {
        read: Box<Binding>,
        write: Box<Binding>,
    },
}

impl Binding {
    /// A read-only binding that selects servers matching `read_preference`.
    pub fn read_preference(
        cluster: Arc<dyn Cluster>,
        read_preference: ReadPreference,
        session: SessionHandle,
    ) -> Self {
        Self::from_kind(BindingKind::ReadPreference {
            cluster,
            read_preference,
            session,
        })
    }

    /// A binding that selects a writable server for both reads and writes.
    pub fn writable(cluster: Arc<dyn Cluster>, session: SessionHandle) -> Self {
        Self::from_kind(BindingKind::Writable { cluster, session })
    }

    /// A binding pinned to one already-selected server.
    pub fn server(server: Arc<dyn Server>, session: SessionHandle) -> Self {
        Self::from_kind(BindingKind::SingleServer { server, session })
    }

    /// A binding pinned to one already-open channel. Takes ownership of the channel handle.
    pub fn channel(channel: Channel, session: SessionHandle) -> Self {
        Self::from_kind(BindingKind::SingleChannel { channel, session })
    }

    /// Composes an independent read binding and write binding.
    ///
    /// Both bindings must share the same underlying session; otherwise operations routed
    /// through the two halves could not be causally ordered, and construction fails with an
    /// argument error.
    pub fn split(read: Binding, write: Binding) -> Result<Self> {
        if !read.session()?.same_session(write.session()?) {
            return Err(Error::invalid_argument(
                "split binding requires the read and write bindings to share a session",
            ));
        }
        Ok(Self::from_kind(BindingKind::Split {
            read: Box::new(read),
            write: Box::new(write),
        }))
    }

    fn from_kind(kind: BindingKind) -> Self {
        Self {
            disposed: AtomicBool::new(false),
            kind,
        }
    }

    fn check_disposed(&self) -> Result<()> {
        if self.disposed.load(Ordering::Acquire) {
            return Err(Error::disposed("Binding"));
        }
        Ok(())
    }

    /// The session this binding routes operations through.
    pub fn session(&self) -> Result<&SessionHandle> {
        self.check_disposed()?;
        match &self.kind {
            BindingKind::ReadPreference { session, .. }
            | BindingKind::Writable { session, .. }
            | BindingKind::SingleServer { session, .. }
            | BindingKind::SingleChannel { session, .. } => Ok(session),
            BindingKind::Split { read, .. } => read.session(),
        }
    }

    /// The read preference this binding selects with, if it has one.
    pub fn read_preference(&self) -> Option<&ReadPreference> {
        match &self.kind {
            BindingKind::ReadPreference {
                read_preference, ..
            } => Some(read_preference),
            BindingKind::Split { read, .. } => read.read_preference(),
            _ => None,
        }
    }

    /// Obtains a channel source for a read, forking the session so the caller owns its own
    /// disposable handle.
    pub async fn read_channel_source(&self, ctx: &OperationContext) -> Result<ChannelSource> {
        self.read_channel_source_deprioritizing(ctx, &[]).await
    }

    /// Obtains a channel source for a write.
    pub async fn write_channel_source(&self, ctx: &OperationContext) -> Result<ChannelSource> {
        self.write_channel_source_deprioritizing(ctx, &[]).await
    }

    /// As [`read_channel_source`](Self::read_channel_source), preferring servers not in
    /// `deprioritized` where the topology allows. Pinned bindings ignore the list.
    pub(crate) fn read_channel_source_deprioritizing<'a>(
        &'a self,
        ctx: &'a OperationContext,
        deprioritized: &'a [ServerAddress],
    ) -> BoxFuture<'a, Result<ChannelSource>> {
        async move {
            self.check_disposed()?;
            match &self.kind {
                BindingKind::ReadPreference {
                    cluster,
                    read_preference,
                    session,
                } => {
                    let criteria = SelectionCriteria::ReadPreference(read_preference.clone());
                    let server = cluster.select_server(&criteria, deprioritized, ctx).await?;
                    Ok(ChannelSource::server(server, session.fork()?))
                }
                BindingKind::Writable { cluster, session } => {
                    let criteria = SelectionCriteria::writable();
                    let server = cluster.select_server(&criteria, deprioritized, ctx).await?;
                    Ok(ChannelSource::server(server, session.fork()?))
                }
                BindingKind::SingleServer { server, session } => {
                    Ok(ChannelSource::server(server.clone(), session.fork()?))
                }
                BindingKind::SingleChannel { channel, session } => {
                    ChannelSource::channel(channel.fork()?, session.fork()?)
                }
                BindingKind::Split { read, .. } => {
                    read.read_channel_source_deprioritizing(ctx, deprioritized).await
                }
            }
        }
        .boxed()
    }

    /// As [`write_channel_source`](Self::write_channel_source), preferring servers not in
    /// `deprioritized` where the topology allows. Pinned bindings ignore the list.
    pub(crate) fn write_channel_source_deprioritizing<'a>(
        &'a self,
        ctx: &'a OperationContext,
        deprioritized: &'a [ServerAddress],
    ) -> BoxFuture<'a, Result<ChannelSource>> {
        async move {
            self.check_disposed()?;
            match &self.kind {
                BindingKind::ReadPreference { .. } => Err(Error::invalid_argument(
                    "a read preference binding cannot provide a write channel source",
                )),
                BindingKind::Writable { cluster, session } => {
                    let criteria = SelectionCriteria::writable();
                    let server = cluster.select_server(&criteria, deprioritized, ctx).await?;
                    Ok(ChannelSource::server(server, session.fork()?))
                }
                BindingKind::SingleServer { server, session } => {
                    Ok(ChannelSource::server(server.clone(), session.fork()?))
                }
                BindingKind::SingleChannel { channel, session } => {
                    ChannelSource::channel(channel.fork()?, session.fork()?)
                }
                BindingKind::Split { write, .. } => {
                    write.write_channel_source_deprioritizing(ctx, deprioritized).await
                }
            }
        }
        .boxed()
    }

    /// Releases this binding's session fork (and pinned channel, where owned). Idempotent;
    /// never disposes a cluster or server the binding does not own.
    pub fn dispose(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        match &self.kind {
            BindingKind::ReadPreference { session, .. }
            | BindingKind::Writable { session, .. }
            | BindingKind::SingleServer { session, .. } => session.dispose(),
            BindingKind::SingleChannel { channel, session } => {
                channel.dispose();
                session.dispose();
            }
            BindingKind::Split { read, write } => {
                read.dispose();
                write.dispose();
            }
        }
    }
}

impl Drop for Binding {
    fn drop(&mut self) {
        self.dispose();
    }
}

impl fmt::Debug for Binding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match &self.kind {
            BindingKind::ReadPreference { .. } => "ReadPreference",
            BindingKind::Writable { .. } => "Writable",
            BindingKind::SingleServer { .. } => "SingleServer",
            BindingKind::SingleChannel { .. } => "SingleChannel",
            BindingKind::Split { .. } => "Split",
        };
        f.debug_struct("Binding")
            .field("kind", &kind)
            .field("disposed", &self.disposed.load(Ordering::Relaxed))
            .finish()
    }
}
