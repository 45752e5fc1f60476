use oke_gateway_controller_core::ReconcileError;

/// Classifies a Kubernetes API error.
///
/// Conflicts, throttling, server errors and not-found (the cache may be ahead
/// of or behind the API server) are retried; other client errors are terminal.
pub fn classify(error: kube::Error) -> ReconcileError {
    let retriable = match &error {
        kube::Error::Api(rsp) => match rsp.code {
            404 | 409 | 429 => true,
            400..=499 => false,
            _ => true,
        },
        _ => true,
    };
    ReconcileError::new(format!("kubernetes API error: {error}"), retriable).with_source(error)
}
