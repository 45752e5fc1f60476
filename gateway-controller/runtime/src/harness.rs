use crate::{middleware::SharedReconciler, rate_limit::RateLimiter};
use futures::{
    future::{BoxFuture, Shared},
    prelude::*,
};
use kube::{
    runtime::{
        controller::{Action, Controller},
        reflector::Store,
    },
    Resource, ResourceExt,
};
use oke_gateway_controller_core::{Request, RequestContext};
use serde::de::DeserializeOwned;
use std::{fmt, sync::Arc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

/// Resolves once a set of caches has completed its initial listing.
pub(crate) type Ready = Shared<BoxFuture<'static, ()>>;

/// Adapts a [`Reconciler`](oke_gateway_controller_core::Reconciler) to a
/// kube [`Controller`], tracking per-object backoff.
pub(crate) struct Harness {
    name: &'static str,
    reconciler: SharedReconciler,
    backoff: RateLimiter<Request>,
    ready: Ready,
    cancel: CancellationToken,
}

#[derive(Debug, thiserror::Error)]
#[error(transparent)]
pub(crate) struct Failed(#[from] anyhow::Error);

// === impl Harness ===

impl Harness {
    pub(crate) fn new(
        name: &'static str,
        reconciler: SharedReconciler,
        ready: Ready,
        cancel: CancellationToken,
    ) -> Arc<Self> {
        Arc::new(Self {
            name,
            reconciler,
            backoff: RateLimiter::default(),
            ready,
            cancel,
        })
    }

    /// Drives `controller` until the harness is cancelled and in-flight
    /// reconciles have finished.
    pub(crate) async fn run<K>(self: Arc<Self>, controller: Controller<K>)
    where
        K: Resource<DynamicType = ()>
            + Clone
            + DeserializeOwned
            + fmt::Debug
            + Send
            + Sync
            + 'static,
    {
        let name = self.name;
        let cancel = self.cancel.clone();
        info!(controller = name, "Starting controller");
        controller
            .graceful_shutdown_on(async move { cancel.cancelled().await })
            .run(reconcile::<K>, error_policy::<K>, self)
            .for_each(|result| async move {
                match result {
                    Ok((obj, action)) => trace!(controller = name, %obj, ?action, "Reconciled"),
                    Err(error) => debug!(controller = name, %error, "Controller error"),
                }
            })
            .await;
        info!(controller = name, "Controller stopped");
    }

    async fn reconcile(&self, req: Request) -> Result<Action, Failed> {
        self.ready.clone().await;
        let rcx = RequestContext::new(self.cancel.child_token());
        let outcome = self.reconciler.reconcile(rcx, req.clone()).await?;
        self.backoff.forget(&req);
        Ok(outcome
            .requeue_after
            .map_or_else(Action::await_change, Action::requeue))
    }

    fn retry(&self, req: Request, error: &Failed) -> Action {
        let delay = self.backoff.when(&req);
        warn!(
            controller = self.name,
            object = %req,
            retries = self.backoff.retries(&req),
            ?delay,
            error = format_args!("{:#}", error.0),
            "Reconcile failed; requeueing"
        );
        Action::requeue(delay)
    }
}

async fn reconcile<K: Resource>(obj: Arc<K>, harness: Arc<Harness>) -> Result<Action, Failed> {
    harness.reconcile(request(&*obj)).await
}

fn error_policy<K: Resource>(obj: Arc<K>, error: &Failed, harness: Arc<Harness>) -> Action {
    harness.retry(request(&*obj), error)
}

fn request<K: Resource>(obj: &K) -> Request {
    Request {
        namespace: obj.namespace(),
        name: obj.name_any(),
    }
}

/// Waits for every store in `stores` to be populated.
pub(crate) fn ready(stores: Vec<BoxFuture<'static, ()>>) -> Ready {
    future::join_all(stores).map(|_| ()).boxed().shared()
}

/// Resolves once `store` has completed its initial listing.
pub(crate) fn store_ready<K>(store: &Store<K>) -> BoxFuture<'static, ()>
where
    K: Resource<DynamicType = ()> + Clone + Send + Sync + 'static,
{
    let store = store.clone();
    async move {
        if store.wait_until_ready().await.is_err() {
            debug!("Store writer dropped before becoming ready");
        }
    }
    .boxed()
}

#[cfg(test)]
mod tests {
    use super::*;
    use oke_gateway_controller_core::{Outcome, ReconcileError, Reconciler};
    use oke_gateway_controller_k8s_api::{Gateway, ObjectMeta};
    use parking_lot::Mutex;
    use pretty_assertions::assert_eq;
    use std::time::Duration;

    struct Script(Mutex<Vec<anyhow::Result<Outcome>>>);

    #[async_trait::async_trait]
    impl Reconciler for Script {
        async fn reconcile(&self, _: RequestContext, _: Request) -> anyhow::Result<Outcome> {
            self.0.lock().remove(0)
        }
    }

    fn harness(results: Vec<anyhow::Result<Outcome>>) -> Arc<Harness> {
        Harness::new(
            "gateway",
            Arc::new(Script(Mutex::new(results))),
            ready(vec![]),
            CancellationToken::new(),
        )
    }

    fn gateway() -> Arc<Gateway> {
        Arc::new(Gateway {
            metadata: ObjectMeta {
                namespace: Some("ns-0".to_string()),
                name: Some("gw-0".to_string()),
                ..Default::default()
            },
            spec: Default::default(),
            status: None,
        })
    }

    #[tokio::test]
    async fn failures_back_off_until_success() {
        let h = harness(vec![
            Err(ReconcileError::retriable("throttled").into()),
            Err(ReconcileError::retriable("throttled").into()),
            Ok(Outcome::requeue_after(Duration::from_secs(60))),
        ]);
        let req = Request::namespaced("ns-0", "gw-0");

        for expected in [5, 10] {
            let error = reconcile(gateway(), h.clone())
                .await
                .expect_err("fails");
            assert_eq!(
                error_policy(gateway(), &error, h.clone()),
                Action::requeue(Duration::from_millis(expected))
            );
        }
        assert_eq!(h.backoff.retries(&req), 2);

        let action = reconcile(gateway(), h.clone()).await.expect("succeeds");
        assert_eq!(action, Action::requeue(Duration::from_secs(60)));
        assert_eq!(h.backoff.retries(&req), 0);
    }

    #[tokio::test]
    async fn done_awaits_change() {
        let h = harness(vec![Ok(Outcome::done())]);
        let action = reconcile(gateway(), h).await.expect("succeeds");
        assert_eq!(action, Action::await_change());
    }
}
