// Scale module - the scale-to-zero control loop
//
// Owns the single shared backend-state record and every scaling decision:
// cold-start gating for incoming requests, the health-probe loop that waits
// out model loading, and the idle watcher's scale-down. All mutation goes
// through the controller; per-request code only ever calls `ensure_warm` and
// `update_activity`.

pub mod activity;
pub mod idle;
pub mod orchestrator;

use activity::ActivityTracker;
use orchestrator::Orchestrator;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::time::Instant;

/// Controller knobs. A value of this struct is passed in at construction so
/// tests can run several controllers in one process.
#[derive(Debug, Clone)]
pub struct ScaleSettings {
    pub deployment: String,
    /// Probed with GET until it returns 200.
    pub backend_health_url: String,
    /// Idle window after which the backend scales to zero.
    pub idle_timeout: Duration,
    /// Budget for the orchestrator to accept a scale-up.
    pub schedule_timeout: Duration,
    /// Budget for the backend to come up after scale-up (model load included).
    pub warm_timeout: Duration,
}

impl ScaleSettings {
    pub fn new(deployment: impl Into<String>, backend_health_url: impl Into<String>) -> Self {
        Self {
            deployment: deployment.into(),
            backend_health_url: backend_health_url.into(),
            idle_timeout: Duration::from_secs(5 * 60),
            schedule_timeout: Duration::from_secs(30),
            warm_timeout: Duration::from_secs(10 * 60),
        }
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum ScaleError {
    #[error("orchestrator unreachable: {0}")]
    OrchestratorUnreachable(String),
    #[error("backend did not become healthy within {0:?}")]
    ColdStartTimeout(Duration),
    #[error("warm-up task ended unexpectedly")]
    WarmUpAborted,
}

#[derive(Debug, Clone)]
enum WarmStatus {
    Pending,
    Ready,
    Failed(ScaleError),
}

/// The one shared mutable record. Invariants: `healthy` implies at least one
/// replica; a cold start in progress implies `desired_replicas == 1`.
#[derive(Debug)]
struct BackendState {
    desired_replicas: u32,
    current_replicas: u32,
    healthy: bool,
    cold_start_in_progress: bool,
    /// Present while a warm-up task is running; waiters clone it.
    warm_watch: Option<watch::Receiver<WarmStatus>>,
}

impl BackendState {
    fn check_invariants(&self) {
        debug_assert!(!self.healthy || self.current_replicas >= 1);
        debug_assert!(!self.cold_start_in_progress || self.desired_replicas == 1);
    }
}

pub struct ScaleController {
    orchestrator: Arc<dyn Orchestrator>,
    settings: ScaleSettings,
    state: Mutex<BackendState>,
    activity: ActivityTracker,
}

impl ScaleController {
    pub fn new(orchestrator: Arc<dyn Orchestrator>, settings: ScaleSettings) -> Arc<Self> {
        Arc::new(Self {
            orchestrator,
            settings,
            state: Mutex::new(BackendState {
                desired_replicas: 0,
                current_replicas: 0,
                healthy: false,
                cold_start_in_progress: false,
                warm_watch: None,
            }),
            activity: ActivityTracker::new(),
        })
    }

    /// Verify the orchestrator answers and seed the replica count. Called once
    /// at startup; failure means exit code 2.
    pub async fn startup_check(&self) -> Result<u32, ScaleError> {
        let replicas = self
            .orchestrator
            .get_replicas(&self.settings.deployment)
            .await
            .map_err(|e| ScaleError::OrchestratorUnreachable(e.to_string()))?;

        {
            let mut state = self.state.lock().await;
            state.current_replicas = replicas;
            state.desired_replicas = replicas.min(1);
            state.check_invariants();
        }

        // A backend already running and answering its health check skips the
        // first cold start.
        if replicas >= 1 {
            if let Ok(200) = self
                .orchestrator
                .health_probe(&self.settings.backend_health_url)
                .await
            {
                let mut state = self.state.lock().await;
                state.healthy = true;
                state.check_invariants();
                tracing::info!("backend already warm at startup");
            }
        }

        Ok(replicas)
    }

    /// Block until the backend is healthy, scaling it up if needed.
    ///
    /// Concurrent callers coalesce onto one warm-up task: at most one
    /// scale-up is in flight. Dropping this future abandons the wait but
    /// never the warm-up itself; other waiters keep their chance.
    pub async fn ensure_warm(self: Arc<Self>) -> Result<(), ScaleError> {
        let mut rx = {
            let mut state = self.state.lock().await;
            if state.healthy {
                return Ok(());
            }
            match &state.warm_watch {
                Some(rx) => rx.clone(),
                None => {
                    let (tx, rx) = watch::channel(WarmStatus::Pending);
                    state.warm_watch = Some(rx.clone());
                    state.desired_replicas = 1;
                    state.cold_start_in_progress = true;
                    state.check_invariants();
                    tracing::info!(
                        deployment = %self.settings.deployment,
                        "cold start: scaling backend up"
                    );
                    let controller = Arc::clone(&self);
                    tokio::spawn(async move { controller.run_warm_up(tx).await });
                    rx
                }
            }
        };

        loop {
            let status = rx.borrow_and_update().clone();
            match status {
                WarmStatus::Ready => return Ok(()),
                WarmStatus::Failed(err) => return Err(err),
                WarmStatus::Pending => {
                    if rx.changed().await.is_err() {
                        return Err(ScaleError::WarmUpAborted);
                    }
                }
            }
        }
    }

    async fn run_warm_up(self: Arc<Self>, tx: watch::Sender<WarmStatus>) {
        let started = Instant::now();
        let result = self.warm_up().await;

        let mut state = self.state.lock().await;
        state.cold_start_in_progress = false;
        state.warm_watch = None;
        match result {
            Ok(()) => {
                state.healthy = true;
                state.current_replicas = 1;
                state.check_invariants();
                tracing::info!(
                    elapsed_secs = started.elapsed().as_secs(),
                    "backend healthy"
                );
                let _ = tx.send(WarmStatus::Ready);
            }
            Err(err) => {
                // A rejected scale-up never took effect; a health timeout
                // leaves the deployment scaled up for the next attempt.
                if matches!(err, ScaleError::OrchestratorUnreachable(_)) {
                    state.desired_replicas = 0;
                }
                state.check_invariants();
                tracing::error!(error = %err, "warm-up failed");
                let _ = tx.send(WarmStatus::Failed(err));
            }
        }
    }

    async fn warm_up(&self) -> Result<(), ScaleError> {
        match tokio::time::timeout(
            self.settings.schedule_timeout,
            self.orchestrator.set_replicas(&self.settings.deployment, 1),
        )
        .await
        {
            Err(_) => {
                return Err(ScaleError::OrchestratorUnreachable(
                    "scale-up not accepted before deadline".to_string(),
                ))
            }
            Ok(Err(err)) => return Err(ScaleError::OrchestratorUnreachable(err.to_string())),
            Ok(Ok(())) => {}
        }

        let deadline = Instant::now() + self.settings.warm_timeout;
        loop {
            match self
                .orchestrator
                .health_probe(&self.settings.backend_health_url)
                .await
            {
                Ok(200) => return Ok(()),
                Ok(status) => tracing::debug!(status, "backend up but not ready"),
                // Connection refused while the pod is scheduling or the
                // server is still loading weights; retry identically.
                Err(err) => tracing::trace!(error = %err, "backend not listening yet"),
            }

            if Instant::now() >= deadline {
                return Err(ScaleError::ColdStartTimeout(self.settings.warm_timeout));
            }
            tokio::time::sleep(probe_delay()).await;
        }
    }

    /// Record request activity. Called once per successfully started response.
    pub fn update_activity(&self) {
        self.activity.touch();
    }

    pub fn idle_for(&self) -> Duration {
        self.activity.idle_for()
    }

    /// One pass of the idle watcher: scale to zero after the idle window.
    /// Scale-down failures are logged and retried on the next tick; they
    /// never surface to requests.
    pub async fn idle_tick(&self) {
        let idle = self.idle_for();
        let mut state = self.state.lock().await;
        if !state.healthy || idle <= self.settings.idle_timeout {
            return;
        }

        tracing::info!(
            idle_secs = idle.as_secs(),
            deployment = %self.settings.deployment,
            "idle timeout reached, scaling backend to zero"
        );
        state.desired_replicas = 0;
        state.cold_start_in_progress = false;
        match self
            .orchestrator
            .set_replicas(&self.settings.deployment, 0)
            .await
        {
            Ok(()) => {
                state.healthy = false;
                state.current_replicas = 0;
                state.check_invariants();
            }
            Err(err) => {
                tracing::warn!(error = %err, "scale-down failed, will retry next tick");
            }
        }
    }

    /// Scale to zero and release resources. Called on shutdown.
    pub async fn stop(&self) {
        let mut state = self.state.lock().await;
        state.desired_replicas = 0;
        state.cold_start_in_progress = false;
        if let Err(err) = self
            .orchestrator
            .set_replicas(&self.settings.deployment, 0)
            .await
        {
            tracing::warn!(error = %err, "scale-down on shutdown failed");
        }
        state.healthy = false;
        state.current_replicas = 0;
        state.check_invariants();
    }

    pub async fn is_healthy(&self) -> bool {
        self.state.lock().await.healthy
    }

    pub fn settings(&self) -> &ScaleSettings {
        &self.settings
    }
}

/// Delay between health probes: 2 s with ±10 % jitter, always inside
/// `[1.8 s, 2.2 s]`.
fn probe_delay() -> Duration {
    use rand::Rng;
    Duration::from_millis(rand::thread_rng().gen_range(1800..=2200))
}

#[cfg(test)]
mod tests {
    use super::orchestrator::mock::MockOrchestrator;
    use super::*;

    fn controller_with(
        orchestrator: Arc<MockOrchestrator>,
        configure: impl FnOnce(&mut ScaleSettings),
    ) -> Arc<ScaleController> {
        let mut settings = ScaleSettings::new("vllm", "http://vllm.ai-apps.svc:8000/health");
        configure(&mut settings);
        ScaleController::new(orchestrator, settings)
    }

    #[test]
    fn test_probe_delay_within_invariant() {
        for _ in 0..100 {
            let delay = probe_delay();
            assert!(delay >= Duration::from_millis(1800));
            assert!(delay <= Duration::from_millis(2200));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_cold_start_probes_until_healthy() {
        let orchestrator = Arc::new(MockOrchestrator::new());
        orchestrator.script_health(&[503, 503, 503]);
        let controller = controller_with(orchestrator.clone(), |_| {});

        controller.clone().ensure_warm().await.unwrap();

        assert_eq!(orchestrator.scale_up_calls(), 1);
        assert_eq!(orchestrator.health_calls(), 4);
        assert!(controller.is_healthy().await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ensure_warm_is_noop_when_healthy() {
        let orchestrator = Arc::new(MockOrchestrator::new());
        let controller = controller_with(orchestrator.clone(), |_| {});

        controller.clone().ensure_warm().await.unwrap();
        controller.clone().ensure_warm().await.unwrap();

        assert_eq!(orchestrator.scale_up_calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_requests_coalesce_to_one_scale_up() {
        let orchestrator = Arc::new(MockOrchestrator::new());
        orchestrator.script_health(&[503, 503]);
        let controller = controller_with(orchestrator.clone(), |_| {});

        let handles: Vec<_> = (0..5)
            .map(|_| {
                let controller = controller.clone();
                tokio::spawn(async move { controller.ensure_warm().await })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        assert_eq!(orchestrator.scale_up_calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cold_start_timeout() {
        let orchestrator = Arc::new(MockOrchestrator::new());
        orchestrator.set_default_health(503);
        let controller = controller_with(orchestrator.clone(), |s| {
            s.warm_timeout = Duration::from_secs(10);
        });

        let err = controller.clone().ensure_warm().await.unwrap_err();
        assert!(matches!(err, ScaleError::ColdStartTimeout(_)));
        assert!(!controller.is_healthy().await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_scale_up_rejection_is_fatal_to_request() {
        let orchestrator = Arc::new(MockOrchestrator::new());
        orchestrator.reject_scale();
        let controller = controller_with(orchestrator.clone(), |_| {});

        let err = controller.clone().ensure_warm().await.unwrap_err();
        assert!(matches!(err, ScaleError::OrchestratorUnreachable(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_waiter_does_not_cancel_warm_up() {
        let orchestrator = Arc::new(MockOrchestrator::new());
        orchestrator.set_default_health(503);
        let controller = controller_with(orchestrator.clone(), |_| {});

        // First caller gives up after one second.
        let waiter = controller.clone();
        let gave_up =
            tokio::time::timeout(Duration::from_secs(1), waiter.ensure_warm()).await;
        assert!(gave_up.is_err());
        assert_eq!(orchestrator.scale_up_calls(), 1);

        // The warm-up kept running; once the backend answers, a later caller
        // succeeds without a second scale-up.
        orchestrator.set_default_health(200);
        controller.clone().ensure_warm().await.unwrap();
        assert_eq!(orchestrator.scale_up_calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_scale_down_exactly_once() {
        let orchestrator = Arc::new(MockOrchestrator::new());
        let controller = controller_with(orchestrator.clone(), |_| {});
        controller.clone().ensure_warm().await.unwrap();
        controller.update_activity();

        tokio::time::advance(Duration::from_secs(6 * 60)).await;
        controller.idle_tick().await;
        assert_eq!(orchestrator.scale_down_calls(), 1);
        assert!(!controller.is_healthy().await);

        // Not healthy any more, so further ticks are no-ops.
        controller.idle_tick().await;
        assert_eq!(orchestrator.scale_down_calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_activity_defers_scale_down() {
        let orchestrator = Arc::new(MockOrchestrator::new());
        let controller = controller_with(orchestrator.clone(), |_| {});
        controller.clone().ensure_warm().await.unwrap();

        tokio::time::advance(Duration::from_secs(6 * 60)).await;
        controller.update_activity();
        controller.idle_tick().await;

        assert_eq!(orchestrator.scale_down_calls(), 0);
        assert!(controller.is_healthy().await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_scale_down_failure_retries_next_tick() {
        let orchestrator = Arc::new(MockOrchestrator::new());
        let controller = controller_with(orchestrator.clone(), |_| {});
        controller.clone().ensure_warm().await.unwrap();
        controller.update_activity();

        tokio::time::advance(Duration::from_secs(6 * 60)).await;
        orchestrator.reject_scale();
        controller.idle_tick().await;
        // Still healthy: the failed scale-down must not lose the backend.
        assert!(controller.is_healthy().await);

        orchestrator.allow_scale();
        controller.idle_tick().await;
        assert_eq!(orchestrator.scale_down_calls(), 1);
        assert!(!controller.is_healthy().await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_scale_down_then_next_request_scales_up_again() {
        let orchestrator = Arc::new(MockOrchestrator::new());
        let controller = controller_with(orchestrator.clone(), |_| {});
        controller.clone().ensure_warm().await.unwrap();
        controller.update_activity();

        tokio::time::advance(Duration::from_secs(6 * 60)).await;
        controller.idle_tick().await;
        assert_eq!(orchestrator.scale_down_calls(), 1);

        controller.clone().ensure_warm().await.unwrap();
        assert_eq!(orchestrator.scale_up_calls(), 2);
        assert!(controller.is_healthy().await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_startup_check_detects_warm_backend() {
        let orchestrator = Arc::new(MockOrchestrator::new());
        orchestrator.set_replicas_direct(1);
        let controller = controller_with(orchestrator.clone(), |_| {});

        let replicas = controller.startup_check().await.unwrap();
        assert_eq!(replicas, 1);
        assert!(controller.is_healthy().await);

        // No cold start needed on the first request.
        controller.clone().ensure_warm().await.unwrap();
        assert_eq!(orchestrator.scale_up_calls(), 0);
    }
}
