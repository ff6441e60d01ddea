use prior_auth_service::{PipelineConfig, create_app};
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Structured JSON logs by default, `LOG_FORMAT=pretty` for development.
fn init_tracing() {
    let log_format = std::env::var("LOG_FORMAT").unwrap_or_else(|_| "json".to_string());
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        "prior_auth_service=debug,graph_flow=debug,tower_http=debug".into()
    });

    match log_format.as_str() {
        "pretty" => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer().pretty())
                .init();
        }
        _ => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(
                    tracing_subscriber::fmt::layer()
                        .json()
                        .with_target(true)
                        .with_level(true),
                )
                .init();
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let config = match PipelineConfig::load() {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "Failed to load configuration");
            return Err(e.into());
        }
    };
    info!(
        provider = ?config.llm.provider,
        query_budget = config.search.query_budget,
        top_n = config.search.top_n,
        "Configuration loaded"
    );

    let app = create_app(&config).await;

    let addr = format!("0.0.0.0:{}", config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!(address = %addr, "Prior authorization service listening");

    axum::serve(listener, app).await?;
    Ok(())
}
