//! Contains the `Error` and `Result` types that `tidepool-core` uses.

use std::{collections::HashSet, fmt, sync::Arc};

use serde::Deserialize;
use thiserror::Error;

use crate::topology::ServerAddress;

const RETRYABLE_READ_CODES: [i32; 13] = [
    11600, 11602, 10107, 13435, 13436, 189, 91, 7, 6, 89, 9001, 134, 262,
];
const RETRYABLE_WRITE_CODES: [i32; 12] = [
    11600, 11602, 10107, 13435, 13436, 189, 91, 7, 6, 89, 9001, 262,
];
const CURSOR_NOT_FOUND_CODE: i32 = 43;

/// Retryable write error label. This label will be added to an error when the error is
/// write-retryable.
pub const RETRYABLE_WRITE_ERROR: &str = "RetryableWriteError";
/// Transient transaction error label. This label will be added to a network error or server
/// selection error that occurs during a transaction.
pub const TRANSIENT_TRANSACTION_ERROR: &str = "TransientTransactionError";
/// Unknown transaction commit result error label. This label will be added to a server selection
/// error, network error, or write-retryable error encountered during a commit.
pub const UNKNOWN_TRANSACTION_COMMIT_RESULT: &str = "UnknownTransactionCommitResult";

/// The result type for all methods that can return an error in the `tidepool-core` crate.
pub type Result<T> = std::result::Result<T, Error>;

/// An error that can occur in the `tidepool-core` crate. The inner
/// [`ErrorKind`](enum.ErrorKind.html) is wrapped in a `Box` to allow the errors to be
/// cloned.
#[derive(Clone, Debug, Error)]
#[error("Kind: {kind}, labels: {labels:?}")]
#[non_exhaustive]
pub struct Error {
    /// The type of error that occurred.
    pub kind: Box<ErrorKind>,

    labels: HashSet<String>,
}

impl Error {
    pub(crate) fn new(kind: ErrorKind, labels: Option<impl IntoIterator<Item = String>>) -> Self {
        let labels: HashSet<String> = labels
            .map(|labels| labels.into_iter().collect())
            .unwrap_or_default();
        Self {
            kind: Box::new(kind),
            labels,
        }
    }

    /// Construct a disposed-resource error for the named resource.
    pub(crate) fn disposed(resource: &'static str) -> Self {
        ErrorKind::Disposed { resource }.into()
    }

    pub(crate) fn internal(message: impl Into<String>) -> Self {
        ErrorKind::Internal {
            message: message.into(),
        }
        .into()
    }

    pub(crate) fn invalid_argument(message: impl Into<String>) -> Self {
        ErrorKind::InvalidArgument {
            message: message.into(),
        }
        .into()
    }

    pub(crate) fn invalid_response(message: impl Into<String>) -> Self {
        ErrorKind::InvalidResponse {
            message: message.into(),
        }
        .into()
    }

    /// Construct a generic network timeout error.
    pub(crate) fn network_timeout() -> Self {
        ErrorKind::Io(Arc::new(std::io::ErrorKind::TimedOut.into())).into()
    }

    pub(crate) fn server_selection_timeout(
        message: impl Into<String>,
        address: Option<&ServerAddress>,
    ) -> Self {
        let message = match address {
            Some(address) => format!("{} (selecting {})", message.into(), address),
            None => message.into(),
        };
        ErrorKind::ServerSelection { message }.into()
    }

    /// Whether a handle, binding, cursor, or session was used after its own disposal.
    pub fn is_disposed(&self) -> bool {
        matches!(self.kind.as_ref(), ErrorKind::Disposed { .. })
    }

    pub(crate) fn is_invalid_argument(&self) -> bool {
        matches!(self.kind.as_ref(), ErrorKind::InvalidArgument { .. })
    }

    pub(crate) fn is_network_error(&self) -> bool {
        matches!(self.kind.as_ref(), ErrorKind::Io(..))
    }

    pub(crate) fn is_network_timeout(&self) -> bool {
        matches!(self.kind.as_ref(), ErrorKind::Io(ref io_err) if io_err.kind() == std::io::ErrorKind::TimedOut)
    }

    /// Whether this error indicates that the server no longer knows about the cursor being
    /// iterated.
    pub fn is_cursor_not_found(&self) -> bool {
        match self.kind.as_ref() {
            ErrorKind::CursorNotFound { .. } => true,
            ErrorKind::Command(ref err) => err.code == CURSOR_NOT_FOUND_CODE,
            _ => false,
        }
    }

    /// Whether a read operation should be retried if this error occurs.
    pub(crate) fn is_read_retryable(&self) -> bool {
        if self.is_network_error() {
            return true;
        }
        match self.code() {
            Some(code) => RETRYABLE_READ_CODES.contains(&code),
            None => false,
        }
    }

    /// Whether a write operation should be retried if this error occurs.
    pub(crate) fn is_write_retryable(&self) -> bool {
        if self.is_network_error() || self.contains_label(RETRYABLE_WRITE_ERROR) {
            return true;
        }
        match self.code() {
            Some(code) => RETRYABLE_WRITE_CODES.contains(&code),
            None => false,
        }
    }

    /// Returns the labels for this error.
    pub fn labels(&self) -> &HashSet<String> {
        &self.labels
    }

    /// Whether this error contains the specified label.
    pub fn contains_label<T: AsRef<str>>(&self, label: T) -> bool {
        self.labels.contains(label.as_ref())
    }

    /// Gets the server error code from this error, if applicable. Write concern error codes
    /// are checked; write error codes are not.
    pub(crate) fn code(&self) -> Option<i32> {
        match self.kind.as_ref() {
            ErrorKind::Command(command_error) => Some(command_error.code),
            ErrorKind::WriteConcern(wc_error) => Some(wc_error.code),
            _ => None,
        }
    }
}

impl<E> From<E> for Error
where
    ErrorKind: From<E>,
{
    fn from(err: E) -> Self {
        Error::new(err.into(), None::<Option<String>>)
    }
}

impl From<std::io::Error> for ErrorKind {
    fn from(err: std::io::Error) -> Self {
        Self::Io(Arc::new(err))
    }
}

impl From<std::io::ErrorKind> for ErrorKind {
    fn from(err: std::io::ErrorKind) -> Self {
        Self::Io(Arc::new(err.into()))
    }
}

impl From<bson::de::Error> for ErrorKind {
    fn from(err: bson::de::Error) -> Self {
        Self::InvalidResponse {
            message: err.to_string(),
        }
    }
}

impl From<bson::ser::Error> for ErrorKind {
    fn from(err: bson::ser::Error) -> Self {
        Self::Internal {
            message: err.to_string(),
        }
    }
}

impl From<bson::document::ValueAccessError> for ErrorKind {
    fn from(err: bson::document::ValueAccessError) -> Self {
        Self::InvalidResponse {
            message: err.to_string(),
        }
    }
}

/// The types of errors that can occur.
#[allow(missing_docs)]
#[derive(Clone, Debug, Error)]
#[non_exhaustive]
pub enum ErrorKind {
    /// An invalid argument was provided.
    #[error("An invalid argument was provided: {message}")]
    #[non_exhaustive]
    InvalidArgument { message: String },

    /// A handle was used after it was disposed.
    #[error("{resource} was used after being disposed")]
    #[non_exhaustive]
    Disposed { resource: &'static str },

    /// The server returned an error to an attempted operation.
    #[error("Command failed: {0}")]
    Command(CommandError),

    /// The server no longer knows about the cursor id a `getMore` referenced.
    #[error("Cursor {cursor_id} not found on the server")]
    #[non_exhaustive]
    CursorNotFound { cursor_id: i64 },

    #[error("Internal error: {message}")]
    #[non_exhaustive]
    Internal { message: String },

    /// Wrapper around [`std::io::Error`](https://doc.rust-lang.org/std/io/struct.Error.html).
    #[error("I/O error: {0}")]
    Io(Arc<std::io::Error>),

    /// The server returned an invalid reply to a database operation.
    #[error("The server returned an invalid reply to a database operation: {message}")]
    #[non_exhaustive]
    InvalidResponse { message: String },

    /// No server could be selected for the operation before its deadline.
    #[error("{message}")]
    #[non_exhaustive]
    ServerSelection { message: String },

    /// The deployment does not support sessions.
    #[error("Attempted to use a session on a deployment that does not support sessions")]
    SessionsNotSupported,

    /// An error occurred when trying to satisfy a write concern.
    #[error("The server could not satisfy the write concern: {0}")]
    WriteConcern(WriteConcernError),

    /// An error occurred during a transaction.
    #[error("{message}")]
    #[non_exhaustive]
    Transaction { message: String },
}

/// An error that occurred due to a database command failing.
#[derive(Clone, Debug, Deserialize)]
#[non_exhaustive]
pub struct CommandError {
    /// Identifies the type of error.
    pub code: i32,

    /// The name associated with the error code.
    #[serde(rename = "codeName", default)]
    pub code_name: String,

    /// A description of the error that occurred.
    #[serde(rename = "errmsg", default = "String::new")]
    pub message: String,
}

impl fmt::Display for CommandError {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        write!(
            fmt,
            "Error code {} ({}): {}",
            self.code, self.code_name, self.message
        )
    }
}

/// An error that occurred due to not being able to satisfy a write concern.
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[non_exhaustive]
pub struct WriteConcernError {
    /// Identifies the type of write concern error.
    pub code: i32,

    /// The name associated with the error code.
    #[serde(rename = "codeName", default)]
    pub code_name: String,

    /// A description of the error that occurred.
    #[serde(alias = "errmsg", default = "String::new")]
    pub message: String,
}

impl fmt::Display for WriteConcernError {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        write!(
            fmt,
            "Error code {} ({}): {}",
            self.code, self.code_name, self.message
        )
    }
}

/// A response body useful for deserializing command errors.
#[derive(Deserialize, Debug)]
pub(crate) struct CommandErrorBody {
    #[serde(rename = "errorLabels")]
    pub(crate) error_labels: Option<Vec<String>>,

    #[serde(flatten)]
    pub(crate) command_error: CommandError,
}

impl From<CommandErrorBody> for Error {
    fn from(response: CommandErrorBody) -> Error {
        Error::new(
            ErrorKind::Command(response.command_error),
            response.error_labels,
        )
    }
}
