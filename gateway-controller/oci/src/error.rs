use crate::{model::WorkRequestState, WorkRequestId};
use oke_gateway_controller_core::ReconcileError;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The OCI API returned a non-success status.
    #[error("OCI service error: {status} {code}: {message}")]
    Service {
        status: u16,
        code: String,
        message: String,
        opc_request_id: Option<String>,
    },

    #[error("OCI request failed: {0}")]
    Transport(#[source] reqwest::Error),

    #[error("failed to decode OCI response: {0}")]
    Decode(#[source] serde_json::Error),

    #[error("OCI response is missing the opc-work-request-id header")]
    MissingWorkRequestId,

    #[error("failed to get work request {id}: {source}")]
    GetWorkRequest {
        id: WorkRequestId,
        #[source]
        source: Box<Error>,
    },

    #[error("work request {id} is in {state} state")]
    WorkRequestFailed {
        id: WorkRequestId,
        state: WorkRequestState,
    },

    #[error("work request {id} timed out: deadline exceeded")]
    Timeout { id: WorkRequestId },

    #[error("work request {id} timed out: context canceled")]
    Cancelled { id: WorkRequestId },

    #[error("invalid OCI configuration: {0}")]
    Config(String),

    #[error("failed to sign OCI request: {0}")]
    Signing(String),
}

// === impl Error ===

impl Error {
    pub fn service(status: u16, code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Service {
            status,
            code: code.into(),
            message: message.into(),
            opc_request_id: None,
        }
    }

    /// The HTTP status of the underlying service error, if any.
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Service { status, .. } => Some(*status),
            Self::GetWorkRequest { source, .. } => source.status(),
            _ => None,
        }
    }

    pub fn code(&self) -> Option<&str> {
        match self {
            Self::Service { code, .. } => Some(code.as_str()),
            Self::GetWorkRequest { source, .. } => source.code(),
            _ => None,
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.status() == Some(404)
    }

    /// Client-side mistakes are terminal, except for conflicts and throttling.
    pub fn is_retriable(&self) -> bool {
        match self {
            Self::Service { status, .. } => match *status {
                409 | 429 => true,
                400..=499 => false,
                _ => true,
            },
            Self::GetWorkRequest { source, .. } => source.is_retriable(),
            Self::Config(_) | Self::Signing(_) => false,
            Self::Transport(_)
            | Self::Decode(_)
            | Self::MissingWorkRequestId
            | Self::WorkRequestFailed { .. }
            | Self::Timeout { .. }
            | Self::Cancelled { .. } => true,
        }
    }
}

impl From<Error> for ReconcileError {
    fn from(error: Error) -> Self {
        ReconcileError::new(error.to_string(), error.is_retriable()).with_source(error)
    }
}
