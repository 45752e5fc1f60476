use std::{fmt, sync::Arc, time::Duration};
use tokio_util::sync::CancellationToken;

/// Identifies the object to reconcile.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Request {
    pub namespace: Option<String>,
    pub name: String,
}

/// The successful result of a reconcile.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Outcome {
    pub requeue_after: Option<Duration>,
}

/// Per-reconcile context handed down through the middleware chain.
#[derive(Clone, Debug, Default)]
pub struct RequestContext {
    correlation_id: Option<Arc<str>>,
    cancel: CancellationToken,
}

#[async_trait::async_trait]
pub trait Reconciler: Send + Sync + 'static {
    async fn reconcile(&self, cx: RequestContext, req: Request) -> anyhow::Result<Outcome>;
}

// === impl Request ===

impl Request {
    pub fn namespaced(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: Some(namespace.into()),
            name: name.into(),
        }
    }

    pub fn cluster(name: impl Into<String>) -> Self {
        Self {
            namespace: None,
            name: name.into(),
        }
    }
}

impl fmt::Display for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.namespace.as_deref() {
            Some(ns) => write!(f, "{}/{}", ns, self.name),
            None => self.name.fmt(f),
        }
    }
}

// === impl Outcome ===

impl Outcome {
    pub fn done() -> Self {
        Self::default()
    }

    pub fn requeue_after(after: Duration) -> Self {
        Self {
            requeue_after: Some(after),
        }
    }
}

// === impl RequestContext ===

impl RequestContext {
    pub fn new(cancel: CancellationToken) -> Self {
        Self {
            correlation_id: None,
            cancel,
        }
    }

    pub fn with_correlation_id(mut self, id: impl Into<Arc<str>>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }

    pub fn correlation_id(&self) -> Option<&str> {
        self.correlation_id.as_deref()
    }

    /// Cancelled when the process is shutting down.
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }
}

#[async_trait::async_trait]
impl<R: Reconciler + ?Sized> Reconciler for Arc<R> {
    async fn reconcile(&self, cx: RequestContext, req: Request) -> anyhow::Result<Outcome> {
        (**self).reconcile(cx, req).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_display() {
        assert_eq!(Request::namespaced("ns-0", "gw").to_string(), "ns-0/gw");
        assert_eq!(Request::cluster("oke").to_string(), "oke");
    }

    #[test]
    fn correlation_id_is_optional() {
        let cx = RequestContext::default();
        assert_eq!(cx.correlation_id(), None);
        let cx = cx.with_correlation_id("abc");
        assert_eq!(cx.correlation_id(), Some("abc"));
        assert!(!cx.cancellation().is_cancelled());
    }
}
