use std::fmt;

type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// A reconcile failure tagged as retriable or terminal.
///
/// Retriable errors are returned to the controller so that the key is
/// requeued with backoff. Terminal errors are logged and dropped by the
/// error-handling middleware; the condition they carry should already have
/// been written to the primary object.
#[derive(Debug, thiserror::Error)]
#[error("{message}")]
pub struct ReconcileError {
    message: String,
    retriable: bool,
    condition: Option<FailedCondition>,
    #[source]
    source: Option<BoxError>,
}

/// The condition to surface on the primary object when a reconcile fails.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FailedCondition {
    pub type_: String,
    pub reason: String,
}

// === impl ReconcileError ===

impl ReconcileError {
    pub fn new(message: impl Into<String>, retriable: bool) -> Self {
        Self {
            message: message.into(),
            retriable,
            condition: None,
            source: None,
        }
    }

    pub fn terminal(message: impl Into<String>) -> Self {
        Self::new(message, false)
    }

    pub fn retriable(message: impl Into<String>) -> Self {
        Self::new(message, true)
    }

    pub fn with_condition(mut self, type_: impl Into<String>, reason: impl Into<String>) -> Self {
        self.condition = Some(FailedCondition {
            type_: type_.into(),
            reason: reason.into(),
        });
        self
    }

    pub fn with_source<E>(mut self, source: E) -> Self
    where
        E: Into<BoxError>,
    {
        self.source = Some(source.into());
        self
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn is_retriable(&self) -> bool {
        self.retriable
    }

    pub fn condition(&self) -> Option<&FailedCondition> {
        self.condition.as_ref()
    }

    /// Finds the outermost `ReconcileError` in an error chain.
    pub fn find(error: &anyhow::Error) -> Option<&Self> {
        error.chain().find_map(|e| e.downcast_ref::<Self>())
    }

    /// Returns true if the error chain holds a terminal `ReconcileError`.
    ///
    /// Errors that were never classified are retriable.
    pub fn is_terminal(error: &anyhow::Error) -> bool {
        Self::find(error).map_or(false, |e| !e.retriable)
    }
}

impl fmt::Display for FailedCondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}={}", self.type_, self.reason)
    }
}
