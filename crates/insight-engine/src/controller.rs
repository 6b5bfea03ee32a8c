//! Bounded plan → dispatch → synthesize loop for deep analysis.
//!
//! Each round asks the reasoning provider for its next turn. Tool calls of a
//! round run concurrently on a fixed-width pool and the round does not end
//! until every one of them has an outcome. Outcomes go back to the provider
//! tagged with their `call_id`. The loop stops on terminal text, on the round
//! budget, on a provider fault, on cancellation or on the run deadline.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

use insight_core::messages::{ReasoningTurn, ToolCall, ToolOutcome, Transcript, TranscriptEntry};
use insight_core::provider::ReasoningProvider;
use insight_core::tools::{CallContext, ToolInvocationError, ToolSpec};

use crate::error::EngineError;
use crate::registry::ToolInvoker;

pub const DEFAULT_MAX_ROUNDS: u32 = 5;
pub const DEFAULT_POOL_SIZE: usize = 4;
pub const DEFAULT_MAX_RUN_DURATION: Duration = Duration::from_secs(600);

const EMPTY_TURN_NUDGE: &str =
    "Your last turn had neither tool calls nor an answer. Call a tool or give the final answer.";

#[derive(Clone, Debug)]
pub struct ControllerConfig {
    pub max_rounds: u32,
    pub pool_size: usize,
    pub max_run_duration: Duration,
    pub system_instruction: Option<String>,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            max_rounds: DEFAULT_MAX_ROUNDS,
            pool_size: DEFAULT_POOL_SIZE,
            max_run_duration: DEFAULT_MAX_RUN_DURATION,
            system_instruction: None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ControllerState {
    Planning,
    Dispatching,
    Synthesizing,
    Done,
    Failed,
}

impl fmt::Display for ControllerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Planning => "planning",
            Self::Dispatching => "dispatching",
            Self::Synthesizing => "synthesizing",
            Self::Done => "done",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Final text of a run. `truncated` is set when the round budget ran out
/// before the provider produced an answer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Synthesis {
    pub text: String,
    pub rounds: u32,
    pub truncated: bool,
}

pub struct DeepAnalysisController {
    provider: Arc<dyn ReasoningProvider>,
    invoker: ToolInvoker,
    config: ControllerConfig,
}

impl DeepAnalysisController {
    pub fn new(provider: Arc<dyn ReasoningProvider>, invoker: ToolInvoker, config: ControllerConfig) -> Self {
        Self {
            provider,
            invoker,
            config,
        }
    }

    pub fn config(&self) -> &ControllerConfig {
        &self.config
    }

    #[instrument(skip(self, question, ctx), fields(request_id = %ctx.request_id, session_id = %ctx.session_id))]
    pub async fn run(&self, question: &str, ctx: &CallContext) -> Result<Synthesis, EngineError> {
        let deadline = Instant::now() + self.config.max_run_duration;
        let specs = self.invoker.specs();
        let mut transcript = Transcript::new(self.config.system_instruction.clone(), question);
        let mut partial: Option<String> = None;
        let max_rounds = self.config.max_rounds.max(1);

        info!(
            request_id = %ctx.request_id,
            provider = self.provider.name(),
            model = self.provider.model(),
            max_rounds,
            "deep analysis started"
        );

        for round in 1..=max_rounds {
            transition(ctx, round, ControllerState::Planning);
            ctx.thought(format!("Planning analysis (round {round} of {max_rounds})..."));

            let turn = match self.plan(&transcript, &specs, ctx, deadline).await {
                Ok(turn) => turn,
                Err(e) => {
                    transition(ctx, round, ControllerState::Failed);
                    warn!(request_id = %ctx.request_id, round, error = %e, "deep analysis failed");
                    return Err(e);
                }
            };
            transcript.push(TranscriptEntry::Model(turn.clone()));

            if !turn.has_tool_calls() {
                if let Some(text) = turn.final_text() {
                    transition(ctx, round, ControllerState::Synthesizing);
                    ctx.thought("Synthesizing findings...");
                    transition(ctx, round, ControllerState::Done);
                    return Ok(Synthesis {
                        text: text.to_string(),
                        rounds: round,
                        truncated: false,
                    });
                }
                warn!(request_id = %ctx.request_id, round, "provider returned an empty turn");
                transcript.push(TranscriptEntry::User(EMPTY_TURN_NUDGE.to_string()));
                continue;
            }

            if let Some(text) = turn.final_text() {
                partial = Some(text.to_string());
            }

            transition(ctx, round, ControllerState::Dispatching);
            ctx.thought(format!("Running {} tool call(s)...", turn.tool_calls.len()));
            let outcomes = self.dispatch(&turn.tool_calls, ctx).await;
            if ctx.cancel.is_cancelled() {
                transition(ctx, round, ControllerState::Failed);
                return Err(EngineError::Aborted);
            }
            transcript.push(TranscriptEntry::Outcomes(outcomes));
        }

        warn!(request_id = %ctx.request_id, max_rounds, "round budget exhausted");
        transition(ctx, max_rounds, ControllerState::Done);
        let notice = format!("[analysis stopped after {max_rounds} rounds without a final answer]");
        let text = match partial {
            Some(p) => format!("{p}\n\n{notice}"),
            None => notice,
        };
        Ok(Synthesis {
            text,
            rounds: max_rounds,
            truncated: true,
        })
    }

    async fn plan(
        &self,
        transcript: &Transcript,
        specs: &[ToolSpec],
        ctx: &CallContext,
        deadline: Instant,
    ) -> Result<ReasoningTurn, EngineError> {
        if ctx.cancel.is_cancelled() {
            return Err(EngineError::Aborted);
        }
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(EngineError::RunTimeout(self.config.max_run_duration));
        }
        tokio::select! {
            _ = ctx.cancel.cancelled() => Err(EngineError::Aborted),
            r = tokio::time::timeout(remaining, self.provider.next_turn(transcript, specs)) => match r {
                Ok(turn) => Ok(turn?),
                Err(_) => Err(EngineError::RunTimeout(self.config.max_run_duration)),
            },
        }
    }

    /// Run one round of calls on the pool and wait for all of them. Outcomes
    /// come back in call order.
    async fn dispatch(&self, calls: &[ToolCall], ctx: &CallContext) -> Vec<ToolOutcome> {
        let permits = Arc::new(Semaphore::new(self.config.pool_size.max(1)));
        let mut slots: Vec<Option<ToolOutcome>> = vec![None; calls.len()];
        let mut workers: JoinSet<(usize, ToolOutcome)> = JoinSet::new();

        for (idx, call) in calls.iter().enumerate() {
            let Some(tool) = self.invoker.resolve(&call.name) else {
                warn!(tool = %call.name, call_id = %call.call_id, "unknown tool, skipping");
                slots[idx] = Some(ToolOutcome::no_result(call, format!("unknown tool: {}", call.name)));
                continue;
            };
            let permits = Arc::clone(&permits);
            let invoker = self.invoker.clone();
            let call = call.clone();
            let ctx = ctx.clone();
            workers.spawn(async move {
                let outcome = match permits.acquire_owned().await {
                    Ok(_permit) => invoker.run(tool, &call, &ctx).await,
                    Err(_) => ToolOutcome::failed(&call, ToolInvocationError::Cancelled),
                };
                (idx, outcome)
            });
        }

        while let Some(joined) = workers.join_next().await {
            match joined {
                Ok((idx, outcome)) => slots[idx] = Some(outcome),
                Err(e) => warn!(error = %e, "tool worker did not complete"),
            }
        }

        slots
            .into_iter()
            .zip(calls)
            .map(|(slot, call)| {
                slot.unwrap_or_else(|| {
                    ToolOutcome::failed(call, ToolInvocationError::Crashed("worker task aborted".into()))
                })
            })
            .collect()
    }
}

fn transition(ctx: &CallContext, round: u32, state: ControllerState) {
    debug!(request_id = %ctx.request_id, round, state = %state, "controller state");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use insight_core::errors::GatewayError;
    use insight_core::ids::{SessionId, UserId};
    use insight_core::messages::OutcomeStatus;
    use insight_core::tools::Tool;
    use insight_llm::{MockReasoner, MockTurn};
    use serde_json::{json, Value};
    use tokio_util::sync::CancellationToken;

    use crate::registry::ToolRegistry;

    /// Sleeps, tracking how many invocations overlap. A `delay_ms` argument
    /// overrides the default delay for that call.
    struct SleepTool {
        delay: Duration,
        active: AtomicUsize,
        peak: AtomicUsize,
        calls: AtomicUsize,
        finished: AtomicUsize,
    }

    impl SleepTool {
        fn new(delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                delay,
                active: AtomicUsize::new(0),
                peak: AtomicUsize::new(0),
                calls: AtomicUsize::new(0),
                finished: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl Tool for SleepTool {
        fn name(&self) -> &str {
            "AnalyticsQuery"
        }
        fn description(&self) -> &str {
            "sleeps"
        }
        fn parameters_schema(&self) -> Value {
            json!({"type": "object"})
        }
        async fn invoke(&self, args: Value, _ctx: &CallContext) -> Result<Value, ToolInvocationError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            let delay = args
                .get("delay_ms")
                .and_then(Value::as_u64)
                .map_or(self.delay, Duration::from_millis);
            tokio::time::sleep(delay).await;
            self.active.fetch_sub(1, Ordering::SeqCst);
            self.finished.fetch_add(1, Ordering::SeqCst);
            Ok(json!({"echo": args}))
        }
    }

    fn ctx() -> CallContext {
        CallContext::new(SessionId::from_raw("s"), UserId::from_raw("u"))
    }

    fn query(n: usize) -> ToolCall {
        ToolCall::new("AnalyticsQuery", json!({"question": format!("q{n}")}))
    }

    fn slow_query(n: usize, delay_ms: u64) -> ToolCall {
        ToolCall::new(
            "AnalyticsQuery",
            json!({"question": format!("q{n}"), "delay_ms": delay_ms}),
        )
    }

    /// Records, as each reasoning call starts, how many tool invocations
    /// have finished and which outcomes the transcript carries.
    struct Gauged {
        inner: MockReasoner,
        tool: Arc<SleepTool>,
        seen: parking_lot::Mutex<Vec<(usize, Vec<ToolOutcome>)>>,
    }

    #[async_trait]
    impl ReasoningProvider for Gauged {
        fn name(&self) -> &str {
            self.inner.name()
        }

        fn model(&self) -> &str {
            self.inner.model()
        }

        async fn next_turn(
            &self,
            transcript: &Transcript,
            tools: &[ToolSpec],
        ) -> Result<ReasoningTurn, GatewayError> {
            let latest = transcript
                .entries
                .iter()
                .rev()
                .find_map(|e| match e {
                    TranscriptEntry::Outcomes(o) => Some(o.clone()),
                    _ => None,
                })
                .unwrap_or_default();
            let finished = self.tool.finished.load(Ordering::SeqCst);
            self.seen.lock().push((finished, latest));
            self.inner.next_turn(transcript, tools).await
        }
    }

    fn controller(
        provider: Arc<dyn ReasoningProvider>,
        tool: Arc<SleepTool>,
        config: ControllerConfig,
    ) -> DeepAnalysisController {
        let mut registry = ToolRegistry::new();
        registry.register(tool);
        DeepAnalysisController::new(provider, ToolInvoker::new(Arc::new(registry)), config)
    }

    #[tokio::test(start_paused = true)]
    async fn direct_answer_finishes_in_one_round() {
        let provider = Arc::new(MockReasoner::new(vec![MockTurn::text("Revenue is flat.")]));
        let c = controller(provider.clone(), SleepTool::new(Duration::ZERO), ControllerConfig::default());
        let synthesis = c.run("how is revenue?", &ctx()).await.unwrap();
        assert_eq!(synthesis.text, "Revenue is flat.");
        assert_eq!(synthesis.rounds, 1);
        assert!(!synthesis.truncated);
        assert_eq!(provider.observed()[0].tool_names, vec!["AnalyticsQuery"]);
    }

    #[tokio::test(start_paused = true)]
    async fn round_waits_for_every_outcome() {
        let tool = SleepTool::new(Duration::ZERO);
        let provider = Arc::new(Gauged {
            inner: MockReasoner::new(vec![
                MockTurn::calls(vec![slow_query(1, 50), slow_query(2, 2_000), slow_query(3, 50)]),
                MockTurn::text("done"),
            ]),
            tool: tool.clone(),
            seen: parking_lot::Mutex::new(Vec::new()),
        });
        let c = controller(provider.clone(), tool.clone(), ControllerConfig::default());
        c.run("q", &ctx()).await.unwrap();

        let seen = provider.seen.lock().clone();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0].0, 0);
        // The slow call finished before the provider was asked again.
        assert_eq!(seen[1].0, 3);
        assert_eq!(seen[1].1.len(), 3);
        assert!(seen[1].1.iter().all(ToolOutcome::is_success));
        assert_eq!(seen[1].1[1].response_payload()["result"]["echo"]["delay_ms"], 2_000);
    }

    #[tokio::test(start_paused = true)]
    async fn calls_run_in_parallel_up_to_pool_width() {
        let provider = Arc::new(MockReasoner::new(vec![
            MockTurn::calls((0..4).map(query).collect()),
            MockTurn::text("done"),
        ]));
        let tool = SleepTool::new(Duration::from_secs(1));
        let c = controller(provider, tool.clone(), ControllerConfig::default());
        let start = Instant::now();
        c.run("q", &ctx()).await.unwrap();
        assert_eq!(tool.peak.load(Ordering::SeqCst), 4);
        assert!(start.elapsed() < Duration::from_millis(1500));
    }

    #[tokio::test(start_paused = true)]
    async fn narrow_pool_bounds_concurrency() {
        let provider = Arc::new(MockReasoner::new(vec![
            MockTurn::calls((0..4).map(query).collect()),
            MockTurn::text("done"),
        ]));
        let tool = SleepTool::new(Duration::from_secs(1));
        let config = ControllerConfig {
            pool_size: 2,
            ..Default::default()
        };
        let c = controller(provider, tool.clone(), config);
        let start = Instant::now();
        c.run("q", &ctx()).await.unwrap();
        assert_eq!(tool.peak.load(Ordering::SeqCst), 2);
        assert!(start.elapsed() >= Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn budget_bounds_provider_calls() {
        let mut turns = Vec::new();
        for i in 0..10 {
            turns.push(MockTurn::Turn(ReasoningTurn {
                text: Some(format!("still digging {i}")),
                tool_calls: vec![query(i)],
            }));
        }
        let provider = Arc::new(MockReasoner::new(turns));
        let config = ControllerConfig {
            max_rounds: 3,
            ..Default::default()
        };
        let c = controller(provider.clone(), SleepTool::new(Duration::ZERO), config);
        let synthesis = c.run("q", &ctx()).await.unwrap();

        assert_eq!(provider.call_count(), 3);
        assert!(synthesis.truncated);
        assert_eq!(
            synthesis.text,
            "still digging 2\n\n[analysis stopped after 3 rounds without a final answer]"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn empty_turns_count_against_budget() {
        let provider = Arc::new(MockReasoner::new(vec![
            MockTurn::empty(),
            MockTurn::empty(),
            MockTurn::text("never reached"),
        ]));
        let config = ControllerConfig {
            max_rounds: 2,
            ..Default::default()
        };
        let c = controller(provider.clone(), SleepTool::new(Duration::ZERO), config);
        let synthesis = c.run("q", &ctx()).await.unwrap();
        assert!(synthesis.truncated);
        assert_eq!(provider.call_count(), 2);
        // Question, empty turn, nudge.
        assert_eq!(provider.observed()[1].entries, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn unknown_tool_yields_no_result() {
        let provider = Arc::new(MockReasoner::new(vec![
            MockTurn::calls(vec![ToolCall::new("Nope", json!({})), query(1)]),
            MockTurn::text("done"),
        ]));
        let tool = SleepTool::new(Duration::ZERO);
        let c = controller(provider.clone(), tool.clone(), ControllerConfig::default());
        let calls = vec![ToolCall::new("Nope", json!({})), query(1)];
        let outcomes = c.dispatch(&calls, &ctx()).await;

        assert!(matches!(outcomes[0].status, OutcomeStatus::NoResult(ref r) if r == "unknown tool: Nope"));
        assert_eq!(outcomes[0].call_id, calls[0].call_id);
        assert!(outcomes[1].is_success());
        assert_eq!(tool.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn provider_fault_fails_the_run() {
        let provider = Arc::new(MockReasoner::new(vec![MockTurn::Error(
            GatewayError::ServerError {
                status: 500,
                body: "boom".into(),
            },
        )]));
        let c = controller(provider, SleepTool::new(Duration::ZERO), ControllerConfig::default());
        let err = c.run("q", &ctx()).await.unwrap_err();
        assert!(matches!(err, EngineError::ControllerFault(_)));
        assert_eq!(err.user_message(), "analysis failed: server error 500: boom");
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_aborts_in_flight_round() {
        let provider = Arc::new(MockReasoner::new(vec![
            MockTurn::calls(vec![query(1)]),
            MockTurn::text("done"),
        ]));
        let c = controller(provider.clone(), SleepTool::new(Duration::from_secs(30)), ControllerConfig::default());
        let cancel = CancellationToken::new();
        let ctx = ctx().with_cancel(cancel.clone());

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            trigger.cancel();
        });
        let err = c.run("q", &ctx).await.unwrap_err();
        assert!(matches!(err, EngineError::Aborted));
        assert_eq!(provider.call_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn run_deadline_stops_slow_provider() {
        let provider = Arc::new(MockReasoner::new(vec![MockTurn::delayed(
            Duration::from_secs(60),
            MockTurn::text("late"),
        )]));
        let config = ControllerConfig {
            max_run_duration: Duration::from_secs(10),
            ..Default::default()
        };
        let c = controller(provider, SleepTool::new(Duration::ZERO), config);
        let err = c.run("q", &ctx()).await.unwrap_err();
        assert!(matches!(err, EngineError::RunTimeout(d) if d == Duration::from_secs(10)));
    }
}
