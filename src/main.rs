use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};

use insight_engine::{
    create_default_registry, AnalyticsQueryTool, ChatEngine, ControllerConfig, DataChatClient,
    DataChatConfig, DeepAnalysisController, ExploreTarget, InMemorySessionGate, KnowledgeSearchTool,
    MultiplexerConfig, SearchClient, StreamMultiplexer, StreamNormalizer, ToolInvoker,
    VisualizationTool, CHART_GUIDANCE,
};
use insight_llm::GeminiReasoner;
use insight_server::{AppState, ServerConfig};
use insight_settings::Settings;
use insight_telemetry::{init_telemetry, parse_level, TelemetryConfig};

#[derive(Parser)]
#[command(name = "insight", about = "Conversational analytics over a governed semantic layer")]
struct Cli {
    /// Settings file (defaults to ~/.insight/settings.json).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the HTTP chat server (default).
    Serve {
        #[arg(long)]
        port: Option<u16>,
    },
    /// Print the effective settings as JSON. Secrets are omitted.
    Config,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let mut settings = match &cli.config {
        Some(path) => insight_settings::load_settings_from_path(path),
        None => insight_settings::load_settings(),
    }
    .context("failed to load settings")?;

    match cli.command.unwrap_or(Command::Serve { port: None }) {
        Command::Config => {
            println!("{}", serde_json::to_string_pretty(&settings)?);
            Ok(())
        }
        Command::Serve { port } => {
            if let Some(port) = port {
                settings.server.port = port;
            }
            serve(settings).await
        }
    }
}

async fn serve(settings: Settings) -> anyhow::Result<()> {
    let telemetry = Arc::new(init_telemetry(TelemetryConfig {
        log_level: parse_level(&settings.telemetry.log_level),
        module_levels: settings
            .telemetry
            .module_level_pairs()
            .into_iter()
            .map(|(module, level)| (module, parse_level(&level)))
            .collect(),
        json: settings.telemetry.json,
        ..Default::default()
    }));

    tracing::info!("starting insight server");

    let server_config = ServerConfig {
        host: settings.server.host.clone(),
        port: settings.server.port,
    };
    let sessions = InMemorySessionGate::with_limits(
        settings.server.session_idle(),
        settings.server.max_sessions,
    );
    let engine = build_engine(settings)?;
    let state = AppState::new(Arc::new(engine), Arc::new(sessions))
        .with_telemetry(telemetry);

    let handle = insight_server::start(server_config, state)
        .await
        .context("failed to start server")?;
    tracing::info!(port = handle.port, "insight server ready");

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl+c")?;
    tracing::info!("shutting down");
    handle.shutdown().await;
    Ok(())
}

fn build_engine(settings: Settings) -> anyhow::Result<ChatEngine> {
    let Settings {
        server,
        analytics,
        search,
        reasoning,
        controller,
        ..
    } = settings;

    let normalizer = StreamNormalizer::new(ExploreTarget::new(
        analytics.looker_instance_uri.clone(),
        analytics.lookml_model.clone(),
        analytics.explore.clone(),
    ));
    let data_chat = DataChatClient::new(DataChatConfig {
        endpoint: analytics.endpoint,
        project: analytics.project,
        location: analytics.location,
        looker_instance_uri: analytics.looker_instance_uri,
        lookml_model: analytics.lookml_model,
        explore: analytics.explore,
        looker_client_id: analytics.looker_client_id,
        looker_client_secret: analytics.looker_client_secret,
        system_instruction: analytics.system_instruction,
        timeout: Duration::from_secs(analytics.timeout_secs),
    })?;
    let analytics_tool = AnalyticsQueryTool::new(Arc::new(data_chat), normalizer);

    let search_tool = if search.endpoint.is_empty() {
        tracing::info!("no search endpoint configured, KnowledgeSearch disabled");
        None
    } else {
        let client = SearchClient::new(
            search.endpoint,
            search.page_size,
            Duration::from_secs(search.timeout_secs),
        )?;
        Some(KnowledgeSearchTool::new(Arc::new(client)))
    };

    let reasoner = Arc::new(GeminiReasoner::new(
        reasoning.endpoint,
        reasoning.model,
        reasoning.api_key,
        Duration::from_secs(reasoning.timeout_secs),
    )?);
    let charts = VisualizationTool::new(reasoner.clone());

    let registry = create_default_registry(analytics_tool, search_tool, Some(charts));
    let invoker = ToolInvoker::new(Arc::new(registry))
        .with_timeout(Duration::from_secs(controller.tool_timeout_secs));

    let system_instruction = match reasoning.system_instruction {
        Some(base) => format!("{base}\n\n{CHART_GUIDANCE}"),
        None => CHART_GUIDANCE.to_string(),
    };
    let deep = DeepAnalysisController::new(
        reasoner,
        invoker.clone(),
        ControllerConfig {
            max_rounds: controller.max_rounds,
            pool_size: controller.pool_size,
            max_run_duration: Duration::from_secs(controller.max_run_duration_secs),
            system_instruction: Some(system_instruction),
        },
    );
    let multiplexer = StreamMultiplexer::new(MultiplexerConfig {
        thought_capacity: server.thought_capacity,
        result_capacity: server.result_capacity,
        poll_interval: server.poll_interval(),
    });

    Ok(ChatEngine::new(invoker, deep, multiplexer))
}
