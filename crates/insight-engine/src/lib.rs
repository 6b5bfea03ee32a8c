pub mod chat;
pub mod controller;
pub mod error;
pub mod multiplexer;
pub mod normalizer;
pub mod registry;
pub mod render;
pub mod session;
pub mod tools;
pub mod truncate;

pub use chat::{ChatEngine, ChatPath};
pub use controller::{ControllerConfig, ControllerState, DeepAnalysisController, Synthesis};
pub use error::EngineError;
pub use multiplexer::{MultiplexerConfig, OutputSender, StreamMultiplexer};
pub use normalizer::{ExploreTarget, MergeReport, StepOutcome, StreamNormalizer};
pub use registry::{ToolInvoker, ToolRegistry};
pub use render::render_insight;
pub use session::InMemorySessionGate;
pub use tools::{
    create_default_registry, AnalyticsQueryTool, AnalyticsSource, ChartConfig, ChunkStream,
    DataChatClient, DataChatConfig, KnowledgeSearchTool, SearchBackend, SearchClient,
    VisualizationTool, CHART_GUIDANCE,
};
