//! clicky-serves
//!
//! HTTP gateway running gptscript tools and relaying their output as
//! server-sent events.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::info;

use clicky_core::config::load_config;
use clicky_core::tracing_init::{init_tracing, with_bootstrap_logging};
use clicky_serves::engine::GptscriptEngine;
use clicky_serves::server::{AppState, serve};

#[derive(Parser, Debug)]
#[command(name = "clicky-serves")]
#[command(version, about = "HTTP gateway for gptscript runs")]
struct Args {
    /// Port to listen on
    #[arg(long, env = "CLICKY_SERVES_SERVER_PORT")]
    port: Option<u16>,

    /// Path to the `gptscript` binary
    #[arg(long)]
    gptscript_bin: Option<PathBuf>,

    /// Ceiling for a single run, in seconds
    #[arg(long)]
    run_timeout_secs: Option<u64>,

    /// Default log level when `RUST_LOG` is unset
    #[arg(long)]
    log_level: Option<String>,

    /// Emit logs as JSON lines
    #[arg(long)]
    log_json: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = with_bootstrap_logging(load_config)?;
    if let Some(port) = args.port {
        config.server.port = port;
    }
    if let Some(bin) = args.gptscript_bin {
        config.engine.gptscript_bin = bin;
    }
    if let Some(secs) = args.run_timeout_secs {
        config.engine.run_timeout_secs = secs;
    }
    if let Some(level) = args.log_level {
        config.server.log_level = level;
    }
    config.server.log_json |= args.log_json;

    init_tracing(&config.server.log_level, config.server.log_json);

    if !std::env::var("OPENAI_API_KEY").is_ok_and(|key| !key.is_empty()) {
        anyhow::bail!("OPENAI_API_KEY is not set");
    }

    let run_timeout = config.engine.run_timeout();
    info!(
        port = config.server.port,
        gptscript_bin = %config.engine.gptscript_bin.display(),
        run_timeout_secs = run_timeout.as_secs(),
        "Starting clicky-serves"
    );

    let engine = GptscriptEngine::new(config.engine.gptscript_bin, config.engine.event_buffer);
    let state = AppState {
        engine: Arc::new(engine),
        run_timeout: run_timeout.max(Duration::from_secs(1)),
        frame_buffer: config.server.frame_buffer,
    };
    let addr = SocketAddr::from(([0, 0, 0, 0], config.server.port));
    serve(addr, state).await?;
    Ok(())
}
