// SPDX-License-Identifier: MIT OR Apache-2.0
#![deny(unsafe_code)]
use anyhow::{Context, Result};
use clap::Parser;
use rosdistro_engine::Engine;
use rosdistro_server::AppState;
use rosdistro_store::Store;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "rosdistro-cache", version, about = "Snapshot-resolution cache server for rosdistro-style package distributions")]
struct Args {
    /// Path to the TOML configuration file.
    #[arg(long, default_value = "rosdistro-cache.toml")]
    config: PathBuf,

    /// Override the database file path from the config.
    #[arg(long)]
    database: Option<PathBuf>,

    /// Bind host.
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// Bind port.
    #[arg(long, default_value_t = 8080)]
    port: u16,

    /// Enable debug logging.
    #[arg(long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = if args.debug { EnvFilter::new("rosdistro=debug") } else { EnvFilter::new("rosdistro=info") };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let mut config = rosdistro_config::load_config(&args.config).with_context(|| format!("load config {}", args.config.display()))?;
    if let Some(database) = &args.database {
        config.database.filename = database.display().to_string();
    }

    let store = Store::open(&config.database.filename).with_context(|| format!("open store {}", config.database.filename))?;
    let engine = Engine::with_defaults(config, store);
    let state = Arc::new(AppState { engine });

    let bind = format!("{}:{}", args.host, args.port);
    info!(bind = %bind, config = %args.config.display(), "rosdistro-cache listening");

    rosdistro_server::serve(state, &bind).await.with_context(|| format!("serve on {bind}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_bind_to_localhost_8080() {
        let args = Args::parse_from(["rosdistro-cache"]);
        assert_eq!(args.host, "127.0.0.1");
        assert_eq!(args.port, 8080);
        assert!(!args.debug);
        assert!(args.database.is_none());
    }

    #[test]
    fn overrides_are_parsed() {
        let args = Args::parse_from(["rosdistro-cache", "--config", "custom.toml", "--database", "other.db", "--port", "9090", "--debug"]);
        assert_eq!(args.config, PathBuf::from("custom.toml"));
        assert_eq!(args.database, Some(PathBuf::from("other.db")));
        assert_eq!(args.port, 9090);
        assert!(args.debug);
    }
}
