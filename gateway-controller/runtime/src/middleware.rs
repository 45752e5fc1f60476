//! Wrappers around a [`Reconciler`] that add behavior to every reconcile.

use crate::metrics::{ReconcileMetrics, ReconcileResult};
use oke_gateway_controller_core::{Outcome, ReconcileError, Reconciler, Request, RequestContext};
use std::{sync::Arc, time::Instant};
use tracing::{debug, error, info_span, Instrument};

pub type SharedReconciler = Arc<dyn Reconciler>;

/// Wraps a reconciler in another.
pub type Middleware = Box<dyn FnOnce(SharedReconciler) -> SharedReconciler + Send>;

/// Runs each reconcile in a span carrying a fresh correlation id.
#[derive(Clone)]
pub struct Traced {
    inner: SharedReconciler,
    controller: &'static str,
}

/// Swallows terminal errors so that they are not retried.
#[derive(Clone)]
pub struct HandleErrors {
    inner: SharedReconciler,
}

/// Records the result and latency of each reconcile.
#[derive(Clone)]
pub struct Measured {
    inner: SharedReconciler,
    controller: &'static str,
    metrics: ReconcileMetrics,
}

/// Applies `middlewares` so that the first one is outermost.
pub fn wireup<I>(reconciler: SharedReconciler, middlewares: I) -> SharedReconciler
where
    I: IntoIterator<Item = Middleware>,
    I::IntoIter: DoubleEndedIterator,
{
    middlewares
        .into_iter()
        .rev()
        .fold(reconciler, |inner, wrap| wrap(inner))
}

// === impl Traced ===

impl Traced {
    pub fn layer(controller: &'static str) -> Middleware {
        Box::new(move |inner| Arc::new(Self { inner, controller }))
    }
}

#[async_trait::async_trait]
impl Reconciler for Traced {
    async fn reconcile(&self, rcx: RequestContext, req: Request) -> anyhow::Result<Outcome> {
        let correlation_id = uuid::Uuid::new_v4().to_string();
        let span = info_span!(
            "reconcile",
            controller = self.controller,
            namespace = req.namespace.as_deref().unwrap_or_default(),
            name = %req.name,
            %correlation_id,
        );
        let rcx = rcx.with_correlation_id(correlation_id);
        self.inner.reconcile(rcx, req).instrument(span).await
    }
}

// === impl HandleErrors ===

impl HandleErrors {
    pub fn layer() -> Middleware {
        Box::new(|inner| Arc::new(Self { inner }))
    }
}

#[async_trait::async_trait]
impl Reconciler for HandleErrors {
    async fn reconcile(&self, rcx: RequestContext, req: Request) -> anyhow::Result<Outcome> {
        match self.inner.reconcile(rcx, req.clone()).await {
            Ok(outcome) => Ok(outcome),
            Err(error) if ReconcileError::is_terminal(&error) => {
                error!(
                    object = %req,
                    error = format_args!("{error:#}"),
                    "Reconcile failed permanently"
                );
                Ok(Outcome::done())
            }
            Err(error) => {
                debug!(
                    object = %req,
                    error = format_args!("{error:#}"),
                    "Reconcile failed; retrying"
                );
                Err(error)
            }
        }
    }
}

// === impl Measured ===

impl Measured {
    pub fn layer(controller: &'static str, metrics: ReconcileMetrics) -> Middleware {
        Box::new(move |inner| {
            Arc::new(Self {
                inner,
                controller,
                metrics,
            })
        })
    }
}

#[async_trait::async_trait]
impl Reconciler for Measured {
    async fn reconcile(&self, rcx: RequestContext, req: Request) -> anyhow::Result<Outcome> {
        let start = Instant::now();
        let result = self.inner.reconcile(rcx, req).await;
        let kind = match &result {
            Ok(_) => ReconcileResult::Ok,
            Err(error) if ReconcileError::is_terminal(error) => ReconcileResult::Terminal,
            Err(_) => ReconcileResult::Error,
        };
        self.metrics.observe(self.controller, kind, start.elapsed());
        result
    }
}
