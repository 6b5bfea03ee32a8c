use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::FutureExt;
use tracing::{error, warn};

use insight_core::messages::{ToolCall, ToolOutcome};
use insight_core::tools::{CallContext, Tool, ToolInvocationError, ToolSpec};

use crate::truncate;

pub const DEFAULT_TOOL_TIMEOUT: Duration = Duration::from_secs(120);

/// Registry of available tools, keyed by name.
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            tools: HashMap::new(),
        }
    }

    /// Register a tool, replacing any tool with the same name.
    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        self.tools.insert(tool.name().to_string(), tool);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).map(Arc::clone)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    /// List all tool names.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tools.keys().cloned().collect();
        names.sort();
        names
    }

    /// Tool descriptions for the reasoning provider, sorted by name.
    pub fn specs(&self) -> Vec<ToolSpec> {
        let mut specs: Vec<ToolSpec> = self.tools.values().map(|t| t.to_spec()).collect();
        specs.sort_by(|a, b| a.name.cmp(&b.name));
        specs
    }

    pub fn count(&self) -> usize {
        self.tools.len()
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Uniform invocation over the registry. Every failure mode (unknown name,
/// tool error, timeout, cancellation, panic) comes back as a [`ToolOutcome`].
#[derive(Clone)]
pub struct ToolInvoker {
    registry: Arc<ToolRegistry>,
    timeout: Duration,
}

impl ToolInvoker {
    pub fn new(registry: Arc<ToolRegistry>) -> Self {
        Self {
            registry,
            timeout: DEFAULT_TOOL_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn resolve(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.registry.get(name)
    }

    pub fn specs(&self) -> Vec<ToolSpec> {
        self.registry.specs()
    }

    /// Resolve and run one call.
    pub async fn invoke(&self, call: &ToolCall, ctx: &CallContext) -> ToolOutcome {
        match self.resolve(&call.name) {
            Some(tool) => self.run(tool, call, ctx).await,
            None => {
                warn!(tool = %call.name, call_id = %call.call_id, "unknown tool");
                ToolOutcome::no_result(call, format!("unknown tool: {}", call.name))
            }
        }
    }

    /// Run an already-resolved tool with the timeout, cancellation and panic
    /// guards applied.
    pub async fn run(&self, tool: Arc<dyn Tool>, call: &ToolCall, ctx: &CallContext) -> ToolOutcome {
        let start = Instant::now();
        let guarded = tokio::time::timeout(
            self.timeout,
            std::panic::AssertUnwindSafe(tool.invoke(call.args.clone(), ctx)).catch_unwind(),
        );

        let result = tokio::select! {
            _ = ctx.cancel.cancelled() => Err(ToolInvocationError::Cancelled),
            r = guarded => match r {
                Ok(Ok(inner)) => inner,
                Ok(Err(panic)) => {
                    let msg = panic_message(&panic);
                    error!(tool = %call.name, panic = %msg, "tool panicked during execution");
                    Err(ToolInvocationError::Crashed(msg))
                }
                Err(_) => {
                    warn!(
                        tool = %call.name,
                        timeout_secs = self.timeout.as_secs(),
                        "tool timed out"
                    );
                    Err(ToolInvocationError::Timeout(self.timeout))
                }
            },
        };

        let duration_ms = start.elapsed().as_millis() as u64;
        match result {
            Ok(payload) => {
                tracing::debug!(
                    tool = %call.name,
                    call_id = %call.call_id,
                    duration_ms,
                    preview = %truncate::preview(&payload.to_string(), 200),
                    "tool succeeded"
                );
                ToolOutcome::success(call, payload)
            }
            Err(e) => {
                warn!(
                    tool = %call.name,
                    call_id = %call.call_id,
                    duration_ms,
                    error = %e,
                    "tool failed"
                );
                ToolOutcome::failed(call, e)
            }
        }
    }
}

fn panic_message(panic: &Box<dyn std::any::Any + Send>) -> String {
    panic
        .downcast_ref::<String>()
        .map(|s| s.as_str())
        .or_else(|| panic.downcast_ref::<&str>().copied())
        .unwrap_or("unknown panic")
        .to_string()
}
