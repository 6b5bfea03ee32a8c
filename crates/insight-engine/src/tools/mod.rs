pub mod analytics_query;
pub mod knowledge_search;
pub mod message_stream;
pub mod visualization;

use std::sync::Arc;

use crate::registry::ToolRegistry;

pub use analytics_query::{AnalyticsQueryTool, AnalyticsSource, DataChatClient, DataChatConfig};
pub use knowledge_search::{KnowledgeSearchTool, SearchBackend, SearchClient};
pub use message_stream::ChunkStream;
pub use visualization::{ChartConfig, VisualizationTool, CHART_GUIDANCE};

/// Registry holding the backend tools. Search and charts are optional.
pub fn create_default_registry(
    analytics: AnalyticsQueryTool,
    search: Option<KnowledgeSearchTool>,
    visualization: Option<VisualizationTool>,
) -> ToolRegistry {
    let mut registry = ToolRegistry::new();
    registry.register(Arc::new(analytics));
    if let Some(search) = search {
        registry.register(Arc::new(search));
    }
    if let Some(visualization) = visualization {
        registry.register(Arc::new(visualization));
    }
    registry
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use insight_llm::MockReasoner;

    use crate::normalizer::StreamNormalizer;

    struct NoSource;

    #[async_trait::async_trait]
    impl AnalyticsSource for NoSource {
        async fn chat(
            &self,
            _q: &str,
            _ctx: &insight_core::tools::CallContext,
        ) -> Result<ChunkStream, insight_core::errors::GatewayError> {
            Ok(futures::stream::empty().boxed())
        }
    }

    #[test]
    fn default_registry_registers_optional_tools() {
        let analytics = || AnalyticsQueryTool::new(Arc::new(NoSource), StreamNormalizer::default());

        let bare = create_default_registry(analytics(), None, None);
        assert_eq!(bare.names(), vec!["AnalyticsQuery"]);

        let charts = VisualizationTool::new(Arc::new(MockReasoner::new(vec![])));
        let full = create_default_registry(analytics(), None, Some(charts));
        assert_eq!(full.names(), vec!["AnalyticsQuery", "Visualization"]);
    }
}
