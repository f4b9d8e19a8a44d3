/// Domain errors raised by the branch lifecycle engine.
///
/// Store and orchestration code wraps these in `anyhow::Error` with extra
/// context; callers that need to tell configuration problems apart from
/// transient failures can `downcast_ref::<BranchError>()`.
#[derive(Debug, thiserror::Error)]
pub enum BranchError {
    /// Missing or invalid settings on a queue entry.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// The requested operation is not allowed in the current state.
    #[error("Precondition failed: {0}")]
    Precondition(String),

    /// A change-log verb that this engine does not know how to replay.
    #[error("Unknown change-log action '{0}'")]
    UnknownAction(String),

    /// An identifier mapping already exists with a different production id.
    #[error("Mapping for {table} #{our_id} already points to #{existing}, refusing to remap it to #{attempted}")]
    MappingConflict {
        table: String,
        our_id: u64,
        existing: u64,
        attempted: u64,
    },

    #[error("{entity} #{id} not found")]
    NotFound { entity: &'static str, id: u64 },

    /// A table or column name that cannot be safely quoted.
    #[error("Invalid identifier '{0}'")]
    InvalidIdentifier(String),

    /// A change-log value that does not have the expected format.
    #[error("Malformed change-log record #{id}: {reason}")]
    MalformedRecord { id: u64, reason: String },
}
