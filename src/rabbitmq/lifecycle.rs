// src/rabbitmq/lifecycle.rs
// One-time start / one-time stop state machine shared by consumers and producers.

use std::sync::Mutex;

use tokio::sync::{oneshot, watch};
use tracing::{debug, warn};

use super::errors::{RabbitMQError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    Requested,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Created,
    Starting,
    Running,
    Stopping(StopReason),
    Stopped,
}

impl State {
    pub fn is_stopping_or_stopped(&self) -> bool {
        matches!(self, State::Stopping(_) | State::Stopped)
    }
}

/// Transitions are compare-and-set under the watch channel's lock, so each
/// edge of the state machine is taken at most once no matter how many
/// callers race for it.
pub(crate) struct Lifecycle {
    name: String,
    state: watch::Sender<State>,
    last_error: Mutex<Option<RabbitMQError>>,
}

impl Lifecycle {
    pub(crate) fn new(name: String) -> Self {
        let (state, _) = watch::channel(State::Created);
        Lifecycle {
            name,
            state,
            last_error: Mutex::new(None),
        }
    }

    pub(crate) fn state(&self) -> State {
        *self.state.borrow()
    }

    /// Created -> Starting. Only the first caller wins.
    pub(crate) fn begin_start(&self) -> bool {
        self.transition(|state| match state {
            State::Created => Some(State::Starting),
            _ => None,
        })
    }

    /// Starting -> Running. Fails when a stop arrived during setup.
    pub(crate) fn mark_running(&self) -> bool {
        self.transition(|state| match state {
            State::Starting => Some(State::Running),
            _ => None,
        })
    }

    /// Sends the stop signal. Returns false if it was already sent.
    ///
    /// An instance that was never started goes straight to `Stopped`.
    pub(crate) fn request_stop(&self, reason: StopReason) -> bool {
        let sent = self.transition(|state| match state {
            State::Created => Some(State::Stopped),
            State::Starting | State::Running => Some(State::Stopping(reason)),
            State::Stopping(_) | State::Stopped => None,
        });
        if sent {
            debug!(instance = %self.name, ?reason, "stop signal sent");
        }
        sent
    }

    /// Records `error` (first one wins) and stops with `StopReason::Failed`.
    pub(crate) fn fail(&self, error: RabbitMQError) {
        warn!(instance = %self.name, %error, "stopping after failure");
        self.record_error(error);
        self.request_stop(StopReason::Failed);
    }

    /// Terminal transition, taken once resources are released.
    pub(crate) fn finish(&self) {
        self.state.send_replace(State::Stopped);
    }

    /// Records a setup failure and goes straight to `Stopped`.
    pub(crate) fn abort_start(&self, error: RabbitMQError) -> RabbitMQError {
        warn!(instance = %self.name, %error, "setup failed");
        self.record_error(error.clone());
        self.finish();
        error
    }

    /// Waits for the spawned setup to report back.
    ///
    /// Setup keeps going if this future is dropped; the task alone decides the
    /// instance's fate from then on.
    pub(crate) async fn setup_outcome(&self, ready: oneshot::Receiver<Result<()>>) -> Result<()> {
        match ready.await {
            Ok(outcome) => outcome,
            Err(_) => Err(self.abort_start(RabbitMQError::Unknown(
                "setup task ended without reporting".to_string(),
            ))),
        }
    }

    pub(crate) fn record_error(&self, error: RabbitMQError) {
        let mut guard = match self.last_error.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if guard.is_none() {
            *guard = Some(error);
        }
    }

    pub(crate) fn last_error(&self) -> Option<RabbitMQError> {
        match self.last_error.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Resolves once a stop has been requested (or the instance is stopped).
    pub(crate) async fn stop_requested(&self) {
        let mut rx = self.state.subscribe();
        // The sender lives as long as `self`, so this cannot observe a closed channel.
        let _ = rx.wait_for(State::is_stopping_or_stopped).await;
    }

    /// Resolves once the instance reached `Stopped`.
    pub(crate) async fn stopped(&self) {
        let mut rx = self.state.subscribe();
        let _ = rx.wait_for(|state| *state == State::Stopped).await;
    }

    fn transition<F>(&self, next: F) -> bool
    where
        F: FnOnce(&State) -> Option<State>,
    {
        self.state.send_if_modified(|state| match next(state) {
            Some(new_state) => {
                *state = new_state;
                true
            }
            None => false,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    fn lifecycle() -> Lifecycle {
        Lifecycle::new("test".to_string())
    }

    #[test]
    fn test_start_gate_opens_once() {
        let lc = lifecycle();
        assert!(lc.begin_start());
        assert!(!lc.begin_start());
        assert!(lc.mark_running());
        assert!(!lc.mark_running());
        assert_eq!(lc.state(), State::Running);
    }

    #[test]
    fn test_stop_gate_fires_once() {
        let lc = lifecycle();
        lc.begin_start();
        lc.mark_running();
        assert!(lc.request_stop(StopReason::Requested));
        assert!(!lc.request_stop(StopReason::Requested));
        assert!(!lc.request_stop(StopReason::Failed));
        assert_eq!(lc.state(), State::Stopping(StopReason::Requested));
    }

    #[test]
    fn test_stop_before_start_is_terminal() {
        let lc = lifecycle();
        assert!(lc.request_stop(StopReason::Requested));
        assert_eq!(lc.state(), State::Stopped);
        assert!(!lc.begin_start());
    }

    #[test]
    fn test_stop_during_setup_blocks_running() {
        let lc = lifecycle();
        lc.begin_start();
        lc.request_stop(StopReason::Requested);
        assert!(!lc.mark_running());
    }

    #[test]
    fn test_first_error_wins() {
        let lc = lifecycle();
        lc.begin_start();
        lc.mark_running();
        lc.fail(RabbitMQError::CallbackError("first".into()));
        lc.fail(RabbitMQError::PublishError("second".into()));
        assert_eq!(lc.last_error(), Some(RabbitMQError::CallbackError("first".into())));
        assert_eq!(lc.state(), State::Stopping(StopReason::Failed));
    }

    #[test]
    fn test_abort_start_records_and_stops() {
        let lc = lifecycle();
        lc.begin_start();
        let error = lc.abort_start(RabbitMQError::ConnectionError("refused".into()));
        assert_eq!(error, RabbitMQError::ConnectionError("refused".into()));
        assert_eq!(lc.last_error(), Some(error));
        assert_eq!(lc.state(), State::Stopped);
    }

    #[tokio::test]
    async fn test_lost_setup_report_stops_instance() {
        let lc = lifecycle();
        lc.begin_start();
        let (ready, ready_rx) = oneshot::channel::<Result<()>>();
        drop(ready);
        assert!(matches!(lc.setup_outcome(ready_rx).await, Err(RabbitMQError::Unknown(_))));
        assert_eq!(lc.state(), State::Stopped);
    }

    #[tokio::test]
    async fn test_waiters_wake_on_transitions() {
        let lc = Arc::new(lifecycle());
        lc.begin_start();
        lc.mark_running();

        let waiter = {
            let lc = lc.clone();
            tokio::spawn(async move {
                lc.stop_requested().await;
                lc.stopped().await;
            })
        };

        lc.request_stop(StopReason::Requested);
        lc.finish();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter should finish")
            .unwrap();
    }
}
