use anyhow::anyhow;

pub type Result<T> = std::result::Result<T, StoreError>;

/// Classification of store failures, mirrored by every operation's result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// A required argument was missing or malformed; detected before any I/O.
    InvalidArgument,
    /// The targeted aggregate is absent from the graph.
    NotFound,
    /// A uniqueness invariant was violated: duplicate create, or multiple
    /// matches where exactly one was expected.
    Conflict,
    /// The store handle was released before the call.
    Disposed,
    /// Cooperative cancellation was observed before the query was issued.
    Cancelled,
    /// Query-engine-level failure (connectivity, protocol). Never generated
    /// by this crate; passed through from the engine unmodified.
    Unavailable,
}

#[derive(Debug)]
pub struct StoreError {
    pub kind: ErrorKind,
    pub code: &'static str,
    pub public: &'static str,
    pub source: anyhow::Error,
}

impl StoreError {
    pub fn invalid(public: &'static str, source: anyhow::Error) -> Self {
        Self {
            kind: ErrorKind::InvalidArgument,
            code: "invalid_argument",
            public,
            source,
        }
    }

    pub fn not_found(public: &'static str, source: anyhow::Error) -> Self {
        Self {
            kind: ErrorKind::NotFound,
            code: "not_found",
            public,
            source,
        }
    }

    pub fn conflict(public: &'static str, source: anyhow::Error) -> Self {
        Self {
            kind: ErrorKind::Conflict,
            code: "conflict",
            public,
            source,
        }
    }

    pub fn conflict_with_code(
        code: &'static str,
        public: &'static str,
        source: anyhow::Error,
    ) -> Self {
        Self {
            kind: ErrorKind::Conflict,
            code,
            public,
            source,
        }
    }

    pub fn disposed(store: &'static str) -> Self {
        Self {
            kind: ErrorKind::Disposed,
            code: "store_disposed",
            public: "Store has been disposed",
            source: anyhow!("{store} used after dispose()"),
        }
    }

    pub fn cancelled(operation: &'static str) -> Self {
        Self {
            kind: ErrorKind::Cancelled,
            code: "operation_cancelled",
            public: "Operation was cancelled",
            source: anyhow!("{operation} observed a cancelled token before I/O"),
        }
    }

    pub fn unavailable(public: &'static str, source: anyhow::Error) -> Self {
        Self {
            kind: ErrorKind::Unavailable,
            code: "engine_unavailable",
            public,
            source,
        }
    }
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({}): {}", self.public, self.code, self.source)
    }
}

impl std::error::Error for StoreError {}

#[cfg(feature = "neo4j")]
impl From<neo4rs::Error> for StoreError {
    fn from(value: neo4rs::Error) -> Self {
        Self::unavailable("Graph engine request failed", anyhow!(value))
    }
}
