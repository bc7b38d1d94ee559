use thiserror::Error;

/// Mapping metadata failed validation before it could be enqueued.
///
/// Surfaced synchronously at `enqueue` time (spec §7) rather than discovered
/// mid-run.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("checkpoint strategy KEY requires a checkpoint-column")]
    KeyStrategyMissingColumn,

    #[error("ORDINAL strategy requires the source query to carry an explicit ORDER BY")]
    OrdinalStrategyMissingOrderBy,

    #[error("batch-size must be positive, got {0}")]
    NonPositiveBatchSize(i64),

    #[error("column mapping has neither a source-column nor a derivation-expression: {target_column}")]
    ColumnWithoutSource { target_column: String },

    #[error("audit column '{0}' must appear after all non-audit columns")]
    AuditColumnOutOfOrder(String),

    #[error("audit column '{0}' cannot be removed")]
    AuditColumnRemoved(String),

    #[error("key-sequence values must be unique and contiguous starting at 1, column {0} violates this")]
    InvalidKeySequence(String),

    #[error("derivation expression on '{column}' failed to parse: {reason}")]
    InvalidDerivationExpression { column: String, reason: String },

    #[error("mapping-reference must be non-empty")]
    EmptyMappingReference,

    #[error("unknown target-connection-ref or source-connection-ref: {0}")]
    UnknownConnectionRef(String),
}

/// An I/O fault classified as retryable at the chunk level (spec §4.5, §7).
#[derive(Debug, Error)]
pub enum TransientIoError {
    #[error("connection reset: {0}")]
    ConnectionReset(String),
    #[error("timeout: {0}")]
    Timeout(String),
    #[error("deadlock detected: {0}")]
    Deadlock(String),
    #[error("lock wait timeout: {0}")]
    LockWaitTimeout(String),
    #[error("rate limited: {0}")]
    RateLimited(String),
    #[error("pool error: {0}")]
    Pool(String),
}

/// A row-level failure that does not fail the chunk (spec §4.7, §7).
#[derive(Debug, Error, Clone)]
pub enum PermanentDataError {
    #[error("type coercion failed for column '{column}': {reason}")]
    TypeCoercion { column: String, reason: String },
    #[error("unique constraint violation on key columns")]
    DuplicateKey,
    #[error("required column '{0}' was null")]
    RequiredColumnNull(String),
    #[error("constraint violation: {0}")]
    ConstraintViolation(String),
}

impl PermanentDataError {
    /// Stable error code recorded on `RowError.error_code` (spec §3).
    pub fn code(&self) -> &'static str {
        match self {
            PermanentDataError::TypeCoercion { .. } => "TYPE_COERCION",
            PermanentDataError::DuplicateKey => "DUPLICATE_KEY",
            PermanentDataError::RequiredColumnNull(_) => "REQUIRED_COLUMN_NULL",
            PermanentDataError::ConstraintViolation(_) => "CONSTRAINT_VIOLATION",
        }
    }
}

/// A fault that fails the chunk immediately, no retry (spec §4.5, §7).
#[derive(Debug, Error)]
pub enum PermanentSystemError {
    #[error("missing table: {0}")]
    MissingTable(String),
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    #[error("syntax error in generated SQL: {0}")]
    SyntaxError(String),
    #[error("unsupported database dialect feature: {0}")]
    UnsupportedDialectFeature(String),
}

/// The queue's compare-and-swap guard rejected a `transition` call because
/// the row is no longer in the expected `from_status` (spec §4.1, §7).
#[derive(Debug, Error, Clone)]
#[error("request {request_id} is not in status {expected:?} (transition rejected)")]
pub struct ConcurrentTransitionError {
    pub request_id: uuid::Uuid,
    pub expected: String,
}

/// Top-level error returned by orchestrator operations, unifying the
/// taxonomy of spec §7 into one propagation surface. Row-level
/// `PermanentDataError`s never reach this type; they stay local to the
/// chunk and are recorded as `RowError` rows instead (spec §7 propagation
/// policy).
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Transient(#[from] TransientIoError),

    #[error(transparent)]
    PermanentSystem(#[from] PermanentSystemError),

    #[error(transparent)]
    ConcurrentTransition(#[from] ConcurrentTransitionError),

    #[error("run cancelled")]
    Cancelled,

    #[error("postgres error: {0}")]
    Postgres(#[from] tokio_postgres::Error),

    #[error("connection pool error: {0}")]
    Pool(#[from] deadpool_postgres::PoolError),

    #[error("pool build error: {0}")]
    PoolBuild(#[from] deadpool_postgres::BuildError),

    #[error("configuration load error: {0}")]
    ConfigLoad(#[from] config::ConfigError),

    #[error("{0}")]
    Other(String),
}

impl OrchestratorError {
    pub fn other(msg: impl Into<String>) -> Self {
        OrchestratorError::Other(msg.into())
    }
}

pub type OrchestratorResult<T> = Result<T, OrchestratorError>;
