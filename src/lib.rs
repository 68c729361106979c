//! The resource and execution core of the Tidepool driver.
//!
//! This crate owns the driver's concurrency and resource backbone: reference-counted
//! session and channel-source handles with fork/dispose semantics, the binding layer that
//! turns a read preference or "must write" intent into a concrete channel given a cluster
//! topology, the cursor protocol state machine, and the retryable read/write operation
//! executors.
//!
//! It is a library core, not a network-facing service. The document model (the [`bson`]
//! crate), topology monitoring (the [`Cluster`](topology::Cluster) and
//! [`Server`](topology::Server) traits), and the wire codec (the
//! [`Connection`](channel::Connection) trait) are external collaborators consumed through
//! their interfaces.
//!
//! The shared-resource rules are strict: the reference-counted handles are the only
//! sanctioned way to share a live session or channel source across concurrently-running
//! logical operations. A binding never hands the same non-forked handle to two concurrent
//! callers, every handle instance disposes at most once, and the wrapped resource is
//! released exactly when the last handle lets go.

#![warn(missing_docs, rustdoc::missing_crate_level_docs)]
#![allow(clippy::match_like_matches_macro)]

pub mod binding;
pub mod channel;
mod concern;
mod context;
pub mod cursor;
pub mod error;
pub mod executor;
mod handle;
pub mod operation;
mod options;
pub(crate) mod runtime;
mod selection_criteria;
pub mod session;
#[cfg(test)]
mod test;
pub mod topology;

pub use crate::{
    binding::Binding,
    channel::{Channel, ChannelSource, Command, Connection},
    concern::{Acknowledgment, WriteConcern},
    context::OperationContext,
    cursor::{Cursor, CursorSpecification},
    options::{SessionOptions, TransactionOptions},
    selection_criteria::{Predicate, ReadPreference, ReadPreferenceOptions, SelectionCriteria, TagSet},
    session::{ClusterTime, ServerSessionPool, SessionHandle},
};

/// A database and collection pair naming the target of an operation.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct Namespace {
    /// The name of the database.
    pub db: String,

    /// The name of the collection.
    pub coll: String,
}

impl Namespace {
    /// Creates a namespace from its parts.
    pub fn new(db: impl Into<String>, coll: impl Into<String>) -> Self {
        Self {
            db: db.into(),
            coll: coll.into(),
        }
    }
}

impl std::fmt::Display for Namespace {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(fmt, "{}.{}", self.db, self.coll)
    }
}
