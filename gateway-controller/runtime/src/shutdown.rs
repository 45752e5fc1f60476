use futures::future::BoxFuture;
use std::{fmt, future::Future, time::Duration};
use tokio::time;
use tracing::{debug, info, warn};

type Hook = Box<dyn FnOnce() -> BoxFuture<'static, anyhow::Result<()>> + Send>;

/// Tasks to complete, in registration order, once shutdown begins.
#[derive(Default)]
pub struct ShutdownHooks {
    hooks: Vec<(String, Hook)>,
}

/// The hooks that failed or did not finish in time.
#[derive(Debug, thiserror::Error)]
#[error("shutdown failed: {}", describe(.failures))]
pub struct ShutdownError {
    pub failures: Vec<(String, anyhow::Error)>,
}

// === impl ShutdownHooks ===

impl ShutdownHooks {
    pub fn register<F, Fut>(&mut self, name: impl Into<String>, hook: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.hooks
            .push((name.into(), Box::new(move || Box::pin(hook()))));
    }

    pub fn len(&self) -> usize {
        self.hooks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hooks.is_empty()
    }

    /// Runs every hook under a shared deadline. Every hook runs even if an
    /// earlier one fails.
    pub async fn perform(self, timeout: Duration) -> Result<(), ShutdownError> {
        let deadline = time::Instant::now() + timeout;
        let mut failures = Vec::new();
        for (name, hook) in self.hooks {
            debug!(hook = %name, "Running shutdown hook");
            match time::timeout_at(deadline, hook()).await {
                Ok(Ok(())) => {}
                Ok(Err(error)) => {
                    warn!(hook = %name, %error, "Shutdown hook failed");
                    failures.push((name, error));
                }
                Err(_) => {
                    warn!(hook = %name, ?timeout, "Shutdown hook timed out");
                    failures.push((name, anyhow::anyhow!("timed out after {timeout:?}")));
                }
            }
        }

        if failures.is_empty() {
            info!("Shutdown complete");
            return Ok(());
        }
        Err(ShutdownError { failures })
    }
}

impl fmt::Debug for ShutdownHooks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.hooks.iter().map(|(name, _)| name))
            .finish()
    }
}

fn describe(failures: &[(String, anyhow::Error)]) -> String {
    failures
        .iter()
        .map(|(name, error)| format!("{name}: {error:#}"))
        .collect::<Vec<_>>()
        .join("; ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use pretty_assertions::assert_eq;
    use std::sync::Arc;

    #[tokio::test]
    async fn runs_hooks_in_order() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let mut hooks = ShutdownHooks::default();
        for name in ["gateway", "httproute", "gatewayclass"] {
            let order = order.clone();
            hooks.register(name, move || async move {
                order.lock().push(name);
                Ok(())
            });
        }
        assert_eq!(hooks.len(), 3);

        hooks.perform(Duration::from_secs(1)).await.expect("succeeds");
        assert_eq!(*order.lock(), vec!["gateway", "httproute", "gatewayclass"]);
    }

    #[tokio::test]
    async fn accumulates_failures() {
        let ran = Arc::new(Mutex::new(false));
        let mut hooks = ShutdownHooks::default();
        hooks.register("first", || async { Err(anyhow::anyhow!("boom")) });
        let r = ran.clone();
        hooks.register("second", move || async move {
            *r.lock() = true;
            Ok(())
        });
        hooks.register("third", || async { Err(anyhow::anyhow!("bang")) });

        let error = hooks
            .perform(Duration::from_secs(1))
            .await
            .expect_err("hooks failed");
        assert!(*ran.lock());
        assert_eq!(
            error.failures.iter().map(|(n, _)| n.as_str()).collect::<Vec<_>>(),
            vec!["first", "third"]
        );
        assert_eq!(error.to_string(), "shutdown failed: first: boom; third: bang");
    }

    #[tokio::test(start_paused = true)]
    async fn hooks_share_a_deadline() {
        let mut hooks = ShutdownHooks::default();
        hooks.register("slow", || async {
            time::sleep(Duration::from_secs(20)).await;
            Ok(())
        });
        hooks.register("slower", || async {
            time::sleep(Duration::from_secs(20)).await;
            Ok(())
        });

        let error = hooks
            .perform(Duration::from_secs(30))
            .await
            .expect_err("deadline passes");
        assert_eq!(
            error.failures.iter().map(|(n, _)| n.as_str()).collect::<Vec<_>>(),
            vec!["slower"]
        );
    }
}
