use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use ditto_vertex_route::Env;
use ditto_vertex_route::config::GatewaySettings;
use ditto_vertex_route::gateway::{GatewayState, router};
use ditto_vertex_route::runtime::VertexRuntimeFactory;

/// Serves the Vertex AI chat route.
#[derive(Debug, Parser)]
#[command(name = "ditto-vertex-route", version)]
struct Cli {
    /// TOML settings file.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Dotenv file layered over the process environment.
    #[arg(long)]
    dotenv: Option<PathBuf>,

    /// Overrides `listen` from the settings file.
    #[arg(long)]
    listen: Option<String>,

    #[arg(long)]
    json_logs: bool,

    /// Export spans over OTLP/HTTP (needs the `gateway-otel` feature).
    #[arg(long)]
    otel: bool,

    #[arg(long, requires = "otel")]
    otel_endpoint: Option<String>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let mut settings = match cli.config.as_deref() {
        Some(path) => GatewaySettings::load(path).await?,
        None => GatewaySettings::default(),
    };
    if let Some(listen) = cli.listen {
        settings.listen = listen;
    }
    settings.json_logs |= cli.json_logs;

    let env = match cli.dotenv.as_deref() {
        Some(path) => Env::load_dotenv(path).await?,
        None => Env::default(),
    };

    let _otel_guard = init_logging(cli.otel, cli.otel_endpoint.as_deref(), settings.json_logs)?;

    let state = GatewayState::new(env, &settings, Arc::new(VertexRuntimeFactory::new()?))?;
    let app = router(state);
    let listener = tokio::net::TcpListener::bind(&settings.listen).await?;
    tracing::info!(listen = %settings.listen, "ditto-vertex-route listening");
    axum::serve(listener, app).await?;
    Ok(())
}

#[cfg(feature = "gateway-otel")]
fn init_logging(
    otel: bool,
    endpoint: Option<&str>,
    json_logs: bool,
) -> Result<Option<ditto_vertex_route::gateway::otel::OtelGuard>, Box<dyn std::error::Error>> {
    if !otel {
        ditto_vertex_route::gateway::init_logging(json_logs)?;
        return Ok(None);
    }
    Ok(Some(ditto_vertex_route::gateway::otel::init_tracing(
        "ditto-vertex-route",
        endpoint,
        json_logs,
    )?))
}

#[cfg(not(feature = "gateway-otel"))]
fn init_logging(
    otel: bool,
    _endpoint: Option<&str>,
    json_logs: bool,
) -> Result<Option<()>, Box<dyn std::error::Error>> {
    if otel {
        return Err("otel requires `--features gateway-otel`".into());
    }
    ditto_vertex_route::gateway::init_logging(json_logs)?;
    Ok(None)
}
