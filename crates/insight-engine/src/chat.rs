use std::sync::Arc;

use futures::stream::BoxStream;
use serde_json::json;
use tracing::info;

use insight_core::events::StreamFrame;
use insight_core::insight::MergedInsight;
use insight_core::messages::{OutcomeStatus, ToolCall};
use insight_core::tools::CallContext;

use crate::controller::DeepAnalysisController;
use crate::multiplexer::{OutputSender, StreamMultiplexer};
use crate::registry::ToolInvoker;
use crate::render::render_insight;
use crate::tools::analytics_query;

/// Which producer answers a chat request.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ChatPath {
    /// One analytics query, rendered.
    #[default]
    Direct,
    /// Multi-round controller loop.
    DeepAnalysis,
}

impl ChatPath {
    pub fn from_flag(deep_analysis: bool) -> Self {
        if deep_analysis {
            Self::DeepAnalysis
        } else {
            Self::Direct
        }
    }
}

/// Entry point for chat requests: picks the path and runs it under the
/// multiplexer.
pub struct ChatEngine {
    invoker: ToolInvoker,
    controller: Arc<DeepAnalysisController>,
    multiplexer: StreamMultiplexer,
}

impl ChatEngine {
    pub fn new(invoker: ToolInvoker, controller: DeepAnalysisController, multiplexer: StreamMultiplexer) -> Self {
        Self {
            invoker,
            controller: Arc::new(controller),
            multiplexer,
        }
    }

    pub fn stream(&self, path: ChatPath, question: String, ctx: CallContext) -> BoxStream<'static, StreamFrame> {
        info!(
            request_id = %ctx.request_id,
            session_id = %ctx.session_id,
            user_id = %ctx.user_id,
            ?path,
            "chat request"
        );
        let invoker = self.invoker.clone();
        let controller = Arc::clone(&self.controller);
        self.multiplexer.start(ctx, move |ctx, out| async move {
            match path {
                ChatPath::Direct => run_direct(&invoker, &question, &ctx, &out).await,
                ChatPath::DeepAnalysis => run_deep(&controller, &question, &ctx, &out).await,
            }
        })
    }
}

async fn run_direct(
    invoker: &ToolInvoker,
    question: &str,
    ctx: &CallContext,
    out: &OutputSender,
) -> Result<(), String> {
    let call = ToolCall::new(analytics_query::TOOL_NAME, json!({ "question": question }));
    match invoker.invoke(&call, ctx).await.status {
        OutcomeStatus::Success(value) => {
            let insight: MergedInsight =
                serde_json::from_value(value).map_err(|e| format!("internal error: {e}"))?;
            out.emit(render_insight(&insight)).await;
            Ok(())
        }
        OutcomeStatus::Failed(e) => Err(e.to_string()),
        OutcomeStatus::NoResult(reason) => Err(reason),
    }
}

async fn run_deep(
    controller: &DeepAnalysisController,
    question: &str,
    ctx: &CallContext,
    out: &OutputSender,
) -> Result<(), String> {
    let synthesis = controller
        .run(question, ctx)
        .await
        .map_err(|e| e.user_message())?;
    info!(
        request_id = %ctx.request_id,
        rounds = synthesis.rounds,
        truncated = synthesis.truncated,
        "deep analysis finished"
    );
    out.emit(synthesis.text).await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use futures::StreamExt;
    use insight_core::errors::GatewayError;
    use insight_core::events::Channel;
    use insight_core::ids::{SessionId, UserId};
    use insight_core::insight::RawChunk;
    use insight_llm::{MockReasoner, MockTurn};
    use serde_json::Value;

    use crate::controller::ControllerConfig;
    use crate::normalizer::{ExploreTarget, StreamNormalizer};
    use crate::registry::ToolRegistry;
    use crate::tools::{AnalyticsQueryTool, AnalyticsSource, ChunkStream};

    struct StaticSource(Result<Vec<Value>, GatewayError>);

    #[async_trait]
    impl AnalyticsSource for StaticSource {
        async fn chat(&self, _q: &str, _ctx: &CallContext) -> Result<ChunkStream, GatewayError> {
            let values = self.0.clone()?;
            Ok(futures::stream::iter(values.into_iter().map(|v| Ok(RawChunk::classify(v)))).boxed())
        }
    }

    fn engine(source: StaticSource, turns: Vec<MockTurn>) -> ChatEngine {
        let tool = AnalyticsQueryTool::new(
            Arc::new(source),
            StreamNormalizer::new(ExploreTarget::new("https://acme.looker.app", "gaming", "events")),
        );
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(tool));
        let invoker = ToolInvoker::new(Arc::new(registry));
        let controller = DeepAnalysisController::new(
            Arc::new(MockReasoner::new(turns)),
            invoker.clone(),
            ControllerConfig::default(),
        );
        ChatEngine::new(invoker, controller, StreamMultiplexer::default())
    }

    fn ctx() -> CallContext {
        CallContext::new(SessionId::from_raw("default_session"), UserId::from_raw("web_user"))
    }

    fn chunks() -> Vec<Value> {
        vec![
            json!({"text": "Germany leads."}),
            json!({"data": {"result": {
                "data": [{"users.country": "DE", "users.count": 7}],
                "schema": {"fields": [
                    {"name": "users.country", "label_short": "Country"},
                    {"name": "users.count", "label_short": "Users"}
                ]}
            }}}),
        ]
    }

    #[test]
    fn path_from_flag() {
        assert_eq!(ChatPath::from_flag(false), ChatPath::Direct);
        assert_eq!(ChatPath::from_flag(true), ChatPath::DeepAnalysis);
        assert_eq!(ChatPath::default(), ChatPath::Direct);
    }

    #[tokio::test]
    async fn direct_path_renders_table() {
        let engine = engine(StaticSource(Ok(chunks())), vec![]);
        let frames: Vec<_> = engine
            .stream(ChatPath::Direct, "users by country".into(), ctx())
            .collect()
            .await;

        let data: Vec<_> = frames.iter().filter(|f| f.channel() == Channel::Data).collect();
        assert_eq!(data.len(), 1);
        let text = data[0].text();
        assert!(text.starts_with("Germany leads."));
        assert!(text.contains("| Country | Users |"));
        assert!(text.contains("Explore: https://acme.looker.app/embed/explore/gaming/events?fields="));

        let first = frames.first().unwrap();
        assert_eq!(first.text(), "Analyzing question: users by country");
        assert!(frames.iter().all(|f| f.channel() != Channel::Error));
    }

    #[tokio::test]
    async fn direct_path_failure_ends_with_error() {
        let engine = engine(
            StaticSource(Err(GatewayError::AuthenticationFailed("expired".into()))),
            vec![],
        );
        let frames: Vec<_> = engine.stream(ChatPath::Direct, "q".into(), ctx()).collect().await;

        assert!(frames
            .iter()
            .any(|f| f.text() == "Error querying data: authentication failed: expired"));
        assert_eq!(
            frames.last(),
            Some(&StreamFrame::Error("backend error: authentication failed: expired".into()))
        );
    }

    #[tokio::test]
    async fn deep_path_streams_synthesis() {
        let engine = engine(
            StaticSource(Ok(chunks())),
            vec![
                MockTurn::calls(vec![ToolCall::new(
                    analytics_query::TOOL_NAME,
                    json!({"question": "users by country"}),
                )]),
                MockTurn::text("Germany has the most users (7)."),
            ],
        );
        let frames: Vec<_> = engine
            .stream(ChatPath::DeepAnalysis, "where are users?".into(), ctx())
            .collect()
            .await;

        assert_eq!(
            frames.last().map(StreamFrame::text),
            Some("Germany has the most users (7).")
        );
        assert!(frames.iter().any(|f| f.text() == "Analyzing question: users by country"));
    }

    #[tokio::test]
    async fn deep_path_fault_is_user_visible() {
        let engine = engine(
            StaticSource(Ok(vec![])),
            vec![MockTurn::Error(GatewayError::RateLimited { retry_after: None })],
        );
        let frames: Vec<_> = engine
            .stream(ChatPath::DeepAnalysis, "q".into(), ctx())
            .collect()
            .await;
        assert_eq!(
            frames.last(),
            Some(&StreamFrame::Error("analysis failed: rate limited".into()))
        );
    }
}
