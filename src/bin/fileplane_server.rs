//!
//! fileplane server binary
//! -----------------------
//! Starts the HTTP API for one space. Configuration comes from the environment;
//! a few flags override it for local runs.

use anyhow::Result;
use std::env;

use fileplane::config::EffectiveConfig;

fn flag_value(args: &[String], flag: &str) -> Option<String> {
    let mut i = 0;
    while i < args.len() {
        if args[i] == flag && i + 1 < args.len() {
            return Some(args[i + 1].clone());
        }
        i += 1;
    }
    None
}

fn has_flag(args: &[String], flag: &str) -> bool {
    args.iter().any(|a| a == flag)
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .try_init();

    let args: Vec<String> = env::args().collect();
    if has_flag(&args, "--help") || has_flag(&args, "-h") {
        println!("fileplane server\n\nUSAGE:\n  fileplane_server [--http-port N] [--data-root PATH] [--space CODE]\n\nOPTIONS:\n  --http-port N       HTTP API port (env: FILEPLANE_HTTP_PORT, default 8080)\n  --data-root PATH    Metadata store root (env: FILEPLANE_DATA_ROOT)\n  --space CODE        Space code served by this process (env: SPACE_CODE)\n");
        return Ok(());
    }

    let mut cfg = EffectiveConfig::from_env();
    if let Some(port) = flag_value(&args, "--http-port").and_then(|p| p.parse::<u16>().ok()) {
        cfg.http_port = port;
    }
    if let Some(root) = flag_value(&args, "--data-root") {
        cfg.data_root = root;
    }
    if let Some(space) = flag_value(&args, "--space") {
        cfg.configuration_code = format!("local.poms.{}", space);
        cfg.space_code = space;
    }

    tracing::info!(
        space = %cfg.space_code,
        http_port = cfg.http_port,
        data_root = %cfg.data_root,
        backend = ?cfg.storage.kind,
        "fileplane starting"
    );
    fileplane::server::run(cfg).await
}
