//! agent-mesh - HTTP Server Entry Point
//!
//! Builds the default mesh (one model node, the preset tool collections and a
//! ReAct master agent) and serves it over HTTP.

use std::sync::Arc;

use agent_mesh::{
    agents::ReActAgent,
    api,
    config::Config,
    events::BroadcastSink,
    llm::{HttpLlmClient, LlmClient, LlmNode},
    mcp::McpHttpClient,
    memory::InMemoryHistory,
    registry::MeshBuilder,
    tools::presets::{math_tools, time_tools},
};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "agent_mesh=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config = Config::from_env()?;
    let api_key = config.require_api_key()?.to_string();
    info!(
        "Loaded configuration: model={}, base_url={}",
        config.default_model, config.base_url
    );

    let client: Arc<dyn LlmClient> = Arc::new(HttpLlmClient::new(&config.base_url, api_key));
    let defaults = config.node.clone();
    let events = BroadcastSink::new(1024);

    let mut tools = vec!["math_tools", "time_tools"];
    let mut builder = MeshBuilder::new(config.clone())
        .register(Arc::new(
            LlmNode::new("default_llm", client, &config.default_model)
                .with_config(|c| c.defaults(&defaults)),
        ))
        .provider(Arc::new(math_tools()))
        .provider(Arc::new(time_tools()));

    if let Some(endpoint) = &config.mcp_endpoint {
        info!("Registering tool server at {}", endpoint);
        let node_defaults = defaults.clone();
        builder = builder.provider(Arc::new(
            McpHttpClient::new("remote_tools", endpoint)
                .tool_config(move |c| c.defaults(&node_defaults)),
        ));
        tools.push("remote_tools");
    }

    let mesh = builder
        .register(Arc::new(
            ReActAgent::new("assistant", "default_llm")
                .tools(tools)
                .with_config(|c| c.defaults(&defaults).master().persist(true)),
        ))
        .history(Arc::new(InMemoryHistory::new()))
        .sink(Arc::new(events.clone()))
        .build()
        .await?;

    info!("Mesh ready with {} nodes", mesh.registry().len());

    api::serve(mesh, events).await?;

    Ok(())
}
