//! Error types for the state-synchronization core.
//!
//! Errors are split by concern:
//!
//! - [`DefinitionError`]: schema problems caught when the state tree shape is
//!   compiled. These are programming errors and abort startup.
//! - [`ValidationError`]: bad reads/writes against reactive values at runtime.
//! - [`StoreError`]: the backing key-value store is unavailable or returned
//!   garbage. The core never retries; retry policy belongs to the caller.
//! - [`Error`]: the crate-level error. A thin wrapper over the capability
//!   errors plus the failures owned by the event processor and lease manager.

use thiserror::Error;

/// Crate-level result alias.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Fatal schema-definition problems, raised while compiling a
/// [`Schema`](crate::schema::Schema). These abort program startup.
#[derive(Debug, Error)]
pub enum DefinitionError {
    #[error("duplicate field `{field}` on state `{state}`")]
    DuplicateField { state: String, field: String },

    #[error("duplicate substate `{child}` under state `{state}`")]
    DuplicateChild { state: String, child: String },

    #[error("handler `{name}` on state `{state}` shadows a built-in state operation")]
    ReservedHandlerName { state: String, name: String },

    #[error("computed field `{field}` on state `{state}` depends on unknown field `{dep}`")]
    UnknownDependency {
        state: String,
        field: String,
        dep: String,
    },

    /// A cyclic computed dependency would never converge at runtime, so it
    /// is rejected here.
    #[error("cyclic computed dependency: {chain}")]
    CyclicDependency { chain: String },
}

/// Recoverable problems with reads/writes against reactive values.
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("field `{field}` is computed and cannot be assigned")]
    AssignToComputed { field: String },

    #[error("cannot index a {kind} value with {index}")]
    BadIndex { kind: &'static str, index: String },

    #[error("expected a {expected} value, found {found}")]
    WrongKind {
        expected: &'static str,
        found: &'static str,
    },

    #[error("value of type `{type_name}` has no registered serializer")]
    NoSerializer { type_name: &'static str },

    #[error("a serializer for type `{type_name}` is already registered")]
    DuplicateSerializer { type_name: &'static str },

    #[error("{0} values cannot be persisted in a snapshot")]
    NotSnapshotable(&'static str),
}

/// The external store failed. Surfaced to the state-manager caller as-is.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("state store unavailable: {0}")]
    Unavailable(String),

    #[error("failed to encode state snapshot: {0}")]
    Encode(String),

    #[error("failed to decode state snapshot: {0}")]
    Decode(String),
}

/// The crate-level error.
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Definition(#[from] DefinitionError),

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("unknown state path `{0}`")]
    UnknownPath(String),

    #[error("unknown handler `{0}`")]
    UnknownHandler(String),

    #[error("unknown field `{field}` on state `{state}`")]
    UnknownField { state: String, field: String },

    /// User handler code failed. Caught at the event-processor boundary: the
    /// detail is logged server-side and the client only sees a generic alert.
    #[error("handler `{handler}` failed: {message}")]
    HandlerFailed { handler: String, message: String },

    /// A handler emitted something that is not a valid follow-up event.
    #[error("handler `{handler}` emitted an invalid event: {message}")]
    HandlerContract { handler: String, message: String },

    /// The exclusive lease for a token timed out while the holder's mutation
    /// section was still open. The holder's writes are discarded.
    #[error("lease for token `{token}` expired before the mutation was committed")]
    LeaseExpired { token: String },

    /// Async-stepping handlers can only run at the top level of a cycle.
    #[error("handler `{handler}` produced async steps inside a nested call")]
    NestedAsyncSteps { handler: String },
}
