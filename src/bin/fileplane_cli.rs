//!
//! fileplane CLI binary
//! --------------------
//! Maintenance commands run against the configured store and storage backend
//! without going through the HTTP API.

use std::env;

use anyhow::{anyhow, Context, Result};

use fileplane::config::EffectiveConfig;
use fileplane::driver::{Cipher, Storage};
use fileplane::groups::ResourceGroups;
use fileplane::index::PathIndex;
use fileplane::storage::SharedStore;
use fileplane::sync::SyncEngine;

fn print_usage(program: &str) {
    eprintln!(
        "Usage:\n  {program} sync [<space>]             rebuild the path index from storage\n  {program} stat <path>                 show the index node at a full path\n  {program} rotate-key <hex> [<prefix>]  re-encrypt stored objects with a new key\n  {program} generate-key                print a fresh 32-byte key as hex\n\nConfiguration is read from the environment (SPACE_CODE, FILEPLANE_DATA_ROOT, storage settings)."
    );
}

fn open_store(cfg: &EffectiveConfig) -> Result<SharedStore> {
    std::fs::create_dir_all(&cfg.data_root).with_context(|| format!("Failed to create or access data root: {}", cfg.data_root))?;
    SharedStore::new(&cfg.data_root).with_context(|| format!("While opening store at {}", cfg.data_root))
}

fn storage(cfg: &EffectiveConfig) -> Result<Storage> {
    Storage::from_settings(&cfg.storage).map_err(|e| anyhow!("storage: {}", e))
}

async fn cmd_sync(cfg: &EffectiveConfig, space: &str) -> Result<()> {
    let store = open_store(cfg)?;
    let index = PathIndex::open(&store, space);
    let groups = ResourceGroups::open(&store, space, index.clone());
    let engine = SyncEngine::new(storage(cfg)?, index);
    let report = engine.resync_space(space, &groups, |_| Ok(())).await?;
    println!("synced {}: {} files, {} directories", space, report.files, report.directories);
    let failed = store.kv_registry().snapshot_all();
    if failed > 0 {
        return Err(anyhow!("{} stores failed to snapshot", failed));
    }
    Ok(())
}

fn cmd_stat(cfg: &EffectiveConfig, path: &str) -> Result<()> {
    let store = open_store(cfg)?;
    let index = PathIndex::open(&store, &cfg.space_code);
    match index.resolve(path)? {
        Some(node) => println!("{}", serde_json::to_string_pretty(&node)?),
        None => return Err(anyhow!("'{}' is not indexed", path)),
    }
    Ok(())
}

async fn cmd_rotate_key(cfg: &EffectiveConfig, hex_key: &str, prefix: Option<&str>) -> Result<()> {
    let cipher = Cipher::from_hex(hex_key).map_err(|e| anyhow!("new key: {}", e))?;
    let prefix = prefix.map(str::to_string).unwrap_or_else(|| format!("{}/", cfg.space_code));
    let n = storage(cfg)?.rotate_key(&prefix, &cipher).await.map_err(|e| anyhow!("rotate: {}", e))?;
    println!("re-encrypted {} objects under {}", n, prefix);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .try_init();

    let args: Vec<String> = env::args().collect();
    let program = args.first().map(String::as_str).unwrap_or("fileplane_cli");
    let cfg = EffectiveConfig::from_env();

    match args.get(1).map(String::as_str) {
        Some("sync") => {
            let space = args.get(2).cloned().unwrap_or_else(|| cfg.space_code.clone());
            cmd_sync(&cfg, &space).await
        }
        Some("stat") => match args.get(2) {
            Some(p) => cmd_stat(&cfg, p),
            None => {
                print_usage(program);
                Err(anyhow!("stat needs a path"))
            }
        },
        Some("rotate-key") => match args.get(2) {
            Some(k) => cmd_rotate_key(&cfg, k, args.get(3).map(String::as_str)).await,
            None => {
                print_usage(program);
                Err(anyhow!("rotate-key needs a hex key"))
            }
        },
        Some("generate-key") => {
            println!("{}", Cipher::generate_hex_key().map_err(|e| anyhow!("{}", e))?);
            Ok(())
        }
        _ => {
            print_usage(program);
            Ok(())
        }
    }
}
