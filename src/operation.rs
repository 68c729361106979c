//! A trait modeling server side operations, plus the operations this core issues itself.

mod end_transaction;
mod get_more;
mod kill_cursors;

use bson::Document;

pub use end_transaction::{AbortTransaction, CommitTransaction};
pub use get_more::{GetMore, GetMoreResult};
pub use kill_cursors::{KillCursors, KillCursorsResult};

use crate::{
    channel::Command,
    concern::WriteConcern,
    error::{Error, Result},
    selection_criteria::SelectionCriteria,
    topology::ServerDescription,
};

/// The minimum wire version at which `getMore` accepts a `comment` field.
pub(crate) const SERVER_4_4_0_WIRE_VERSION: i32 = 9;

/// The level of retry an operation supports.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Retryability {
    /// The operation is a retryable write.
    Write,

    /// The operation is a retryable read.
    Read,

    /// The operation is never retried.
    None,
}

impl Retryability {
    /// Whether this level of retryability can retry the given error.
    pub(crate) fn can_retry_error(&self, error: &Error) -> bool {
        match self {
            Self::Write => error.is_write_retryable(),
            Self::Read => error.is_read_retryable(),
            Self::None => false,
        }
    }
}

/// A server side operation: how to build its command against a concrete server, and how to
/// interpret the body of a successful response.
///
/// Session bookkeeping (`lsid`, `$clusterTime`, transaction fields) is attached by the
/// executor, not by operations.
pub trait Operation: Send + Sync {
    /// The output type of this operation.
    type O;

    /// The name of the server side command associated with this operation.
    fn name(&self) -> &str;

    /// Returns the command that should be sent to the server as part of this operation.
    /// The operation may store some additional state that is required for handling the
    /// response.
    fn build(&mut self, description: &ServerDescription) -> Result<Command>;

    /// Interprets the body of a successful (`ok: 1`) server response.
    fn handle_response(&self, response: Document) -> Result<Self::O>;

    /// Criteria to use for selecting the server that this operation will be executed on,
    /// when the operation itself constrains it.
    fn selection_criteria(&self) -> Option<&SelectionCriteria> {
        None
    }

    /// The write concern this operation carries, if any.
    fn write_concern(&self) -> Option<&WriteConcern> {
        None
    }

    /// Whether this operation supports sessions or not.
    fn supports_sessions(&self) -> bool {
        true
    }

    /// The level of retryability the operation supports.
    fn retryability(&self) -> Retryability {
        Retryability::None
    }

    /// Updates this operation as needed for a retry.
    fn update_for_retry(&mut self) {}
}
