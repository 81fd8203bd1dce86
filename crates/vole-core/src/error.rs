// Error — All failure modes of the fuser
//
// A single error type across the workspace keeps propagation simple: every
// stage of the pipeline (binding, lowering, scheduling, codegen, invocation)
// returns `Result<T>` and surfaces one of the variants below.

/// All errors that can occur inside the fuser.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// An operator or argument uses a dtype the fuser cannot lower.
    #[error("unsupported dtype: {0}")]
    UnsupportedDtype(String),

    /// No lowering is registered for an operator schema.
    #[error("unsupported schema for node kind '{kind}': {schema}")]
    UnsupportedSchema { kind: String, schema: String },

    /// The input graph violates the fuser's expectations (missing binding,
    /// unknown sizes, unhandled node kind).
    #[error("malformed input: {0}")]
    MalformedInput(String),

    /// A broken internal invariant (mixed devices, missing output buffer).
    #[error("internal assertion failed: {0}")]
    Internal(String),

    /// A required code generator is not present in this process.
    #[error("backend unavailable: {0}")]
    BackendUnavailable(String),

    /// A runtime constraint was violated (invalid loop level, missing
    /// symbolic rank, incompatible feature mix).
    #[error("constraint violated: {0}")]
    Constraint(String),

    /// Generic message for cases not covered above.
    #[error("{0}")]
    Msg(String),
}

impl Error {
    /// Create an error from any string message.
    pub fn msg(s: impl Into<String>) -> Self {
        Error::Msg(s.into())
    }

    pub fn malformed(s: impl Into<String>) -> Self {
        Error::MalformedInput(s.into())
    }

    pub fn internal(s: impl Into<String>) -> Self {
        Error::Internal(s.into())
    }

    pub fn constraint(s: impl Into<String>) -> Self {
        Error::Constraint(s.into())
    }
}

/// Result alias used across the workspace.
pub type Result<T> = std::result::Result<T, Error>;
