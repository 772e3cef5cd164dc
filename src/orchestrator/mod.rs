//! Execution orchestrator: one user-facing "run" action.

use std::sync::Arc;

use tracing::{info, warn};

use crate::{
    api::{ExecuteEndpoint, SubmitError},
    execution::LogEntry,
    render::RenderGate,
    throttle::Throttle,
};

pub const STDERR_ALERT: &str = "エラーが発生しました。実行ログを確認してください。";
pub const FAILURE_ALERT: &str = "コードの実行に失敗しました。実行ログを確認してください。";

/// Displays execution output.
pub trait LogSink: Send + Sync {
    fn clear(&self);
    fn update(&self, entry: &LogEntry);
    fn alert(&self, message: &str);
}

#[derive(Debug)]
pub enum SubmitOutcome {
    /// The server ran the code; `success` is what it reported.
    Completed { success: bool },
    Failed(SubmitError),
}

impl SubmitOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, SubmitOutcome::Completed { success: true })
    }
}

// Ends the in-flight bracket on every exit path.
struct InFlight<'a>(&'a Throttle);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.end();
    }
}

pub struct Orchestrator {
    endpoint: Arc<dyn ExecuteEndpoint>,
    throttle: Throttle,
    gate: RenderGate,
    log: Arc<dyn LogSink>,
}

impl Orchestrator {
    pub fn new(
        endpoint: Arc<dyn ExecuteEndpoint>,
        throttle: Throttle,
        gate: RenderGate,
        log: Arc<dyn LogSink>,
    ) -> Self {
        Self { endpoint, throttle, gate, log }
    }

    pub fn throttle(&self) -> &Throttle {
        &self.throttle
    }

    /// Submits only if the gate is open; `None` when it is closed.
    pub async fn try_submit(&self, code: &str) -> Option<SubmitOutcome> {
        if !self.throttle.allowed() {
            info!(
                target: "hibiki",
                label = %self.throttle.label(),
                remaining_ms = self.throttle.remaining().as_millis() as u64,
                "submission rejected by throttle"
            );
            return None;
        }
        Some(self.submit(code).await)
    }

    /// Runs `code` remotely and reflects the result in the log and render target.
    ///
    /// Does not consult the gate; callers check [`Throttle::allowed`] first.
    pub async fn submit(&self, code: &str) -> SubmitOutcome {
        self.log.clear();
        self.throttle.begin();
        let _in_flight = InFlight(&self.throttle);
        info!(target: "hibiki", bytes = code.len(), "submitting code");

        match self.execute(code).await {
            Ok(success) => {
                info!(target: "hibiki", success, "execution finished");
                SubmitOutcome::Completed { success }
            }
            Err(err) => {
                self.report_failure(&err).await;
                SubmitOutcome::Failed(err)
            }
        }
    }

    async fn execute(&self, code: &str) -> Result<bool, SubmitError> {
        let result = self.endpoint.execute(code).await?;
        self.log.update(&result.log_entry());

        match result.plot.as_ref().filter(|_| result.success) {
            Some(plot) => self
                .gate
                .render(Some(plot))
                .await
                .map_err(|e| SubmitError::Local(e.to_string()))?,
            None => {
                self.blank().await;
                if result.has_stderr() {
                    self.log.alert(STDERR_ALERT);
                }
            }
        }
        Ok(result.success)
    }

    async fn report_failure(&self, err: &SubmitError) {
        warn!(target: "hibiki", kind = err.kind(), error = %err, "execution failed");
        if let Some(wait) = err.suggested_wait() {
            self.throttle.extend_cooldown(wait);
        }
        self.log.update(&LogEntry::failure(err.log_message()));
        self.blank().await;
        self.log.alert(FAILURE_ALERT);
    }

    async fn blank(&self) {
        if let Err(e) = self.gate.render(None).await {
            warn!(target: "hibiki", error = %e, "could not clear plot");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        execution::ExecutionResult,
        loader::tests::{loader_with, CountingFetcher},
        render::tests::{plot, RecordingTarget},
    };
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::{collections::VecDeque, time::Duration};
    use tokio::time::{self, Instant};

    struct FakeEndpoint {
        responses: Mutex<VecDeque<Result<ExecutionResult, SubmitError>>>,
        calls: Mutex<Vec<String>>,
        gate_open_during_call: Mutex<Vec<bool>>,
        gate_view: Throttle,
        delay: Duration,
    }

    #[async_trait]
    impl ExecuteEndpoint for FakeEndpoint {
        async fn execute(&self, code: &str) -> Result<ExecutionResult, SubmitError> {
            self.calls.lock().push(code.to_string());
            self.gate_open_during_call.lock().push(self.gate_view.allowed());
            time::sleep(self.delay).await;
            self.responses
                .lock()
                .pop_front()
                .unwrap_or_else(|| Ok(ExecutionResult { success: true, ..Default::default() }))
        }
    }

    #[derive(Default)]
    struct RecordingLog {
        clears: Mutex<usize>,
        entries: Mutex<Vec<LogEntry>>,
        alerts: Mutex<Vec<String>>,
    }

    impl LogSink for RecordingLog {
        fn clear(&self) {
            *self.clears.lock() += 1;
        }
        fn update(&self, entry: &LogEntry) {
            self.entries.lock().push(entry.clone());
        }
        fn alert(&self, message: &str) {
            self.alerts.lock().push(message.to_string());
        }
    }

    struct Rig {
        orchestrator: Orchestrator,
        endpoint: Arc<FakeEndpoint>,
        fetcher: Arc<CountingFetcher>,
        target: Arc<RecordingTarget>,
        log: Arc<RecordingLog>,
    }

    fn rig(responses: Vec<Result<ExecutionResult, SubmitError>>) -> Rig {
        rig_with(responses, CountingFetcher::new())
    }

    fn rig_with(responses: Vec<Result<ExecutionResult, SubmitError>>, fetcher: CountingFetcher) -> Rig {
        let throttle = Throttle::new(Duration::from_secs(5), Duration::from_millis(200));
        let endpoint = Arc::new(FakeEndpoint {
            responses: Mutex::new(responses.into()),
            calls: Mutex::new(Vec::new()),
            gate_open_during_call: Mutex::new(Vec::new()),
            gate_view: throttle.clone(),
            delay: Duration::from_millis(300),
        });
        let fetcher = Arc::new(fetcher);
        let target = Arc::new(RecordingTarget::default());
        let log = Arc::new(RecordingLog::default());
        let gate = RenderGate::new(Arc::new(loader_with(fetcher.clone())), target.clone(), "3.3.3");
        let orchestrator = Orchestrator::new(endpoint.clone(), throttle, gate, log.clone());
        Rig { orchestrator, endpoint, fetcher, target, log }
    }

    fn rate_limited(retry_after: Option<u64>, detail: &str) -> SubmitError {
        SubmitError::Http {
            status: 429,
            reason: Some("Too Many Requests".into()),
            detail: detail.into(),
            retry_after,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn plain_output_is_logged_without_plot() {
        let rig = rig(vec![Ok(ExecutionResult {
            success: true,
            stdout: Some("1\n".into()),
            execution_time: Some(0.01),
            ..Default::default()
        })]);

        let outcome = rig.orchestrator.submit("print(1)").await;
        assert!(outcome.is_success());

        let entries = rig.log.entries.lock();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].combined(), "1\n");
        assert_eq!(entries[0].formatted_time(), "0.010 秒");
        assert!(rig.target.embeds.lock().is_empty());
        assert!(rig.log.alerts.lock().is_empty());
        assert_eq!(rig.fetcher.count(), 0);
        assert_eq!(*rig.endpoint.gate_open_during_call.lock(), vec![false]);
    }

    #[tokio::test(start_paused = true)]
    async fn plot_loads_library_once_then_embeds() {
        let rig = rig(vec![Ok(ExecutionResult {
            success: true,
            plot: Some(plot(Some("3.3.3"))),
            ..Default::default()
        })]);

        rig.orchestrator.submit("plot()").await;

        assert_eq!(rig.fetcher.count(), 1);
        assert!(rig.fetcher.calls.lock()[0].contains("3.3.3"));
        let embeds = rig.target.embeds.lock();
        assert_eq!(embeds.len(), 1);
        assert_eq!(embeds[0].0, "3.3.3");
    }

    #[tokio::test(start_paused = true)]
    async fn back_to_back_second_submit_rejected() {
        let rig = rig(vec![]);
        let o = &rig.orchestrator;

        let (first, second) = tokio::join!(o.try_submit("a = 1"), async {
            tokio::task::yield_now().await;
            o.try_submit("b = 2").await
        });

        assert!(first.is_some());
        assert!(second.is_none());
        assert_eq!(*rig.endpoint.calls.lock(), vec!["a = 1".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn retry_after_drives_countdown() {
        let rig = rig(vec![Err(rate_limited(Some(10), "あと 10 秒お待ちください。"))]);
        let throttle = rig.orchestrator.throttle().clone();

        let outcome = rig.orchestrator.submit("print(1)").await;
        assert!(matches!(outcome, SubmitOutcome::Failed(SubmitError::Http { status: 429, .. })));

        let failed_at = Instant::now();
        assert_eq!(throttle.label().to_string(), "実行(10)");
        let mut last = 10;
        for step in 1..=24u64 {
            time::sleep_until(failed_at + Duration::from_millis(step * 500)).await;
            if throttle.allowed() {
                break;
            }
            let crate::throttle::GateLabel::Cooldown(secs) = throttle.label() else {
                panic!("unexpected label {}", throttle.label());
            };
            assert!(secs <= last);
            last = secs;
        }
        assert_eq!(last, 1);
        assert!(failed_at.elapsed() >= Duration::from_secs(10));
        assert!(throttle.allowed());

        assert_eq!(*rig.log.alerts.lock(), vec![FAILURE_ALERT.to_string()]);
        let entries = rig.log.entries.lock();
        assert!(entries[0].stderr.as_deref().unwrap_or("").starts_with("HTTP 429 Too Many Requests"));
    }

    #[tokio::test(start_paused = true)]
    async fn textual_wait_hint_extends_cooldown() {
        let rig = rig(vec![Err(rate_limited(None, "あと7秒"))]);
        let throttle = rig.orchestrator.throttle().clone();

        rig.orchestrator.submit("print(1)").await;
        let error_time = Instant::now();
        assert!(!throttle.allowed());
        assert!(throttle.remaining() >= Duration::from_secs(7));

        time::sleep_until(error_time + Duration::from_millis(6_900)).await;
        assert!(!throttle.allowed());
        time::sleep_until(error_time + Duration::from_secs(7)).await;
        assert!(throttle.allowed());
    }

    #[tokio::test(start_paused = true)]
    async fn absurd_retry_after_is_capped() {
        let rig = rig(vec![Err(rate_limited(Some(u64::MAX), "あと 99999999999999999999 秒"))]);
        let throttle = rig.orchestrator.throttle().clone();

        let outcome = rig.orchestrator.submit("print(1)").await;
        assert!(matches!(outcome, SubmitOutcome::Failed(SubmitError::Http { .. })));
        assert_eq!(throttle.remaining(), crate::throttle::MAX_COOLDOWN);
        assert!(!throttle.allowed());
    }

    #[tokio::test(start_paused = true)]
    async fn no_response_blanks_and_alerts() {
        let rig = rig(vec![Err(SubmitError::NoResponse("connection refused".into()))]);
        let throttle = rig.orchestrator.throttle().clone();

        let outcome = rig.orchestrator.submit("print(1)").await;
        assert!(matches!(outcome, SubmitOutcome::Failed(SubmitError::NoResponse(_))));
        assert_eq!(*rig.target.clears.lock(), 1);
        assert_eq!(rig.log.entries.lock()[0].stderr.as_deref(), Some(crate::api::error::NO_RESPONSE_MESSAGE));
        // Default window only.
        assert!(throttle.remaining() <= Duration::from_secs(5));
        assert_eq!(throttle.label(), crate::throttle::GateLabel::Cooldown(5));
    }

    #[tokio::test(start_paused = true)]
    async fn stderr_result_alerts_and_blanks() {
        let rig = rig(vec![Ok(ExecutionResult {
            success: false,
            stderr: Some("NameError: name 'x' is not defined".into()),
            plot: Some(plot(Some("3.3.3"))),
            ..Default::default()
        })]);

        let outcome = rig.orchestrator.submit("x").await;
        assert!(matches!(outcome, SubmitOutcome::Completed { success: false }));
        assert_eq!(*rig.log.alerts.lock(), vec![STDERR_ALERT.to_string()]);
        assert!(rig.target.embeds.lock().is_empty());
        assert_eq!(rig.fetcher.count(), 0);
        assert!(rig.log.entries.lock()[0].is_error());
    }

    #[tokio::test(start_paused = true)]
    async fn library_failure_goes_through_failure_path() {
        let rig = rig_with(
            vec![Ok(ExecutionResult { success: true, plot: Some(plot(Some("9.9.9"))), ..Default::default() })],
            CountingFetcher { fail: true, ..CountingFetcher::new() },
        );
        let throttle = rig.orchestrator.throttle().clone();

        let outcome = rig.orchestrator.submit("plot()").await;
        match outcome {
            SubmitOutcome::Failed(SubmitError::Local(message)) => assert!(message.contains("failed to load")),
            other => panic!("unexpected {:?}", other),
        }
        let entries = rig.log.entries.lock();
        assert_eq!(entries.len(), 2);
        assert!(entries[1].stderr.as_deref().unwrap_or("").starts_with("実行処理中のエラー: "));
        assert_eq!(*rig.log.alerts.lock(), vec![FAILURE_ALERT.to_string()]);

        // In-flight bracket closed even on this path.
        assert_eq!(throttle.label(), crate::throttle::GateLabel::Cooldown(5));
    }

    #[tokio::test(start_paused = true)]
    async fn log_cleared_before_each_submission() {
        let rig = rig(vec![]);
        rig.orchestrator.submit("a").await;
        time::sleep(Duration::from_secs(5)).await;
        assert!(rig.orchestrator.throttle().allowed());
        rig.orchestrator.submit("b").await;
        assert_eq!(*rig.log.clears.lock(), 2);
        assert_eq!(rig.endpoint.calls.lock().len(), 2);
    }
}
