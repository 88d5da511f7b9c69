use std::path::PathBuf;

use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use shadersrv::{Config, Server};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let root = std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from("."));

    let mut config = Config::with_root(&root);
    let ini = root.join("config.ini");
    if ini.exists() {
        match config.apply_ini(&ini) {
            Ok(()) => info!(path = %ini.display(), "loaded config"),
            Err(error) => warn!(path = %ini.display(), %error, "could not read config; using defaults"),
        }
    }

    info!(
        port = config.tcp_port,
        max_connections = config.max_connections,
        caching = config.caching,
        "starting shader compile server"
    );

    let server = Server::build(config).await;
    if let Err(fault) = server.run().await {
        error!(%fault, "server terminated");
        std::process::exit(1);
    }
}
