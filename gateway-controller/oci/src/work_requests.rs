use crate::{client::WorkRequestsClient, model::WorkRequestState, Error, WorkRequestId};
use std::{sync::Arc, time::Duration};
use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument};

/// Polls OCI work requests until they reach a terminal state.
#[derive(Clone)]
pub struct WorkRequestsWatcher {
    client: Arc<dyn WorkRequestsClient>,
    poll_interval: Duration,
    max_poll_duration: Duration,
}

// === impl WorkRequestsWatcher ===

impl WorkRequestsWatcher {
    pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(2);
    pub const DEFAULT_MAX_POLL_DURATION: Duration = Duration::from_secs(20 * 60);

    pub fn new(client: Arc<dyn WorkRequestsClient>) -> Self {
        Self {
            client,
            poll_interval: Self::DEFAULT_POLL_INTERVAL,
            max_poll_duration: Self::DEFAULT_MAX_POLL_DURATION,
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        // A zero period would make the interval timer panic.
        self.poll_interval = interval.max(Duration::from_millis(1));
        self
    }

    pub fn with_max_poll_duration(mut self, max: Duration) -> Self {
        self.max_poll_duration = max;
        self
    }

    /// Waits for the work request to succeed.
    ///
    /// The work request is queried immediately and then once per poll
    /// interval. Fails if the work request fails or is canceled, if it does not
    /// complete within the max poll duration, or if `cancel` fires first.
    #[instrument(skip(self, cancel, id), fields(work_request = %id))]
    pub async fn wait_for(
        &self,
        cancel: &CancellationToken,
        id: &WorkRequestId,
    ) -> Result<(), Error> {
        let mut interval = time::interval(self.poll_interval);
        interval.set_missed_tick_behavior(time::MissedTickBehavior::Delay);
        // The first tick completes immediately.
        interval.tick().await;

        let deadline = time::sleep(self.max_poll_duration);
        tokio::pin!(deadline);

        loop {
            let wr = tokio::select! {
                res = self.client.get_work_request(id) => {
                    res.map_err(|error| Error::GetWorkRequest {
                        id: id.clone(),
                        source: Box::new(error),
                    })?
                }
                _ = cancel.cancelled() => return Err(Error::Cancelled { id: id.clone() }),
            };

            match wr.lifecycle_state {
                WorkRequestState::Succeeded => return Ok(()),
                state @ (WorkRequestState::Failed | WorkRequestState::Canceled) => {
                    return Err(Error::WorkRequestFailed {
                        id: id.clone(),
                        state,
                    })
                }
                state => debug!(%state, "Work request in progress"),
            }

            tokio::select! {
                _ = interval.tick() => {}
                _ = &mut deadline => return Err(Error::Timeout { id: id.clone() }),
                _ = cancel.cancelled() => return Err(Error::Cancelled { id: id.clone() }),
            }
        }
    }
}

impl std::fmt::Debug for WorkRequestsWatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkRequestsWatcher")
            .field("poll_interval", &self.poll_interval)
            .field("max_poll_duration", &self.max_poll_duration)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::WorkRequest;
    use parking_lot::Mutex;
    use std::collections::VecDeque;

    /// Replays a fixed sequence of states; the last one repeats.
    struct Script {
        states: Mutex<VecDeque<WorkRequestState>>,
        calls: Mutex<usize>,
        cancel_on_first_call: Option<CancellationToken>,
    }

    impl Script {
        fn new(states: impl IntoIterator<Item = WorkRequestState>) -> Arc<Self> {
            Arc::new(Self {
                states: Mutex::new(states.into_iter().collect()),
                calls: Mutex::new(0),
                cancel_on_first_call: None,
            })
        }

        fn calls(&self) -> usize {
            *self.calls.lock()
        }
    }

    #[async_trait::async_trait]
    impl WorkRequestsClient for Script {
        async fn get_work_request(&self, id: &WorkRequestId) -> Result<WorkRequest, Error> {
            *self.calls.lock() += 1;
            if let Some(cancel) = self.cancel_on_first_call.as_ref() {
                cancel.cancel();
            }
            let mut states = self.states.lock();
            let state = if states.len() > 1 {
                states.pop_front()
            } else {
                states.front().copied()
            };
            let state = state.ok_or_else(|| Error::service(404, "NotFound", "no work request"))?;
            Ok(WorkRequest {
                id: id.0.clone(),
                lifecycle_state: state,
                message: None,
            })
        }
    }

    fn watcher(script: Arc<Script>, interval: Duration) -> WorkRequestsWatcher {
        WorkRequestsWatcher::new(script).with_poll_interval(interval)
    }

    #[tokio::test(start_paused = true)]
    async fn succeeds_after_polling() {
        use WorkRequestState::*;
        let script = Script::new([Accepted, InProgress, InProgress, Succeeded]);
        let w = watcher(script.clone(), Duration::from_millis(1));
        w.wait_for(&CancellationToken::new(), &"wr-1".into())
            .await
            .expect("work request must succeed");
        assert_eq!(script.calls(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn fails_on_failed_state() {
        use WorkRequestState::*;
        let script = Script::new([Accepted, InProgress, InProgress, Failed]);
        let w = watcher(script.clone(), Duration::from_millis(1));
        let err = w
            .wait_for(&CancellationToken::new(), &"wr-1".into())
            .await
            .expect_err("work request must fail");
        assert!(
            err.to_string().contains("work request wr-1 is in FAILED state"),
            "{err}"
        );
        assert_eq!(script.calls(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn fails_on_canceled_state() {
        let script = Script::new([WorkRequestState::Canceled]);
        let w = watcher(script, Duration::from_millis(1));
        let err = w
            .wait_for(&CancellationToken::new(), &"wr-2".into())
            .await
            .expect_err("work request must fail");
        assert!(matches!(
            err,
            Error::WorkRequestFailed {
                state: WorkRequestState::Canceled,
                ..
            }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn terminal_on_first_poll_does_not_wait() {
        let script = Script::new([WorkRequestState::Succeeded]);
        let w = watcher(script.clone(), Duration::from_secs(60));
        let start = time::Instant::now();
        w.wait_for(&CancellationToken::new(), &"wr-3".into())
            .await
            .expect("work request must succeed");
        assert_eq!(start.elapsed(), Duration::ZERO);
        assert_eq!(script.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_while_waiting() {
        let cancel = CancellationToken::new();
        let script = Arc::new(Script {
            states: Mutex::new([WorkRequestState::Accepted].into_iter().collect()),
            calls: Mutex::new(0),
            cancel_on_first_call: Some(cancel.clone()),
        });
        let w = watcher(script.clone(), Duration::from_secs(60));
        let err = w
            .wait_for(&cancel, &"wr-4".into())
            .await
            .expect_err("wait must be cancelled");
        assert!(matches!(err, Error::Cancelled { .. }), "{err}");
        assert_eq!(script.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn times_out() {
        let script = Script::new([WorkRequestState::Accepted]);
        let w = watcher(script, Duration::from_secs(2))
            .with_max_poll_duration(Duration::from_millis(1));
        let err = w
            .wait_for(&CancellationToken::new(), &"wr-5".into())
            .await
            .expect_err("wait must time out");
        assert!(matches!(err, Error::Timeout { .. }), "{err}");
        assert!(err.to_string().contains("deadline exceeded"));
    }

    #[tokio::test(start_paused = true)]
    async fn wraps_client_errors() {
        let script = Script::new(Vec::new());
        let w = watcher(script, Duration::from_millis(1));
        let err = w
            .wait_for(&CancellationToken::new(), &"wr-6".into())
            .await
            .expect_err("lookup must fail");
        assert!(
            err.to_string().starts_with("failed to get work request wr-6"),
            "{err}"
        );
        assert!(err.is_not_found());
    }
}
