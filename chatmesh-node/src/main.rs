//! chatmesh-node: run one node of a chat cluster.
//!
//! Every flag can also come from the environment, so a container only needs
//! `REDIS_HOST` and `WEBSOCKET_SERVER` set.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use log::info;

use chatmesh_core::{
    ChatNode, MemoryPresence, MemoryStore, MessageStore, NodeConfig, PresenceDirectory,
    RedisPresence, RocksMessageStore, StoreConfig,
};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum PresenceBackend {
    Redis,
    /// Process-local; only for a single node
    Memory,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum StoreBackend {
    Rocksdb,
    /// Not durable
    Memory,
}

#[derive(Debug, Parser)]
#[command(name = "chatmesh-node", version, about = "Horizontally scaled WebSocket chat node")]
struct Cli {
    /// Socket address to listen on
    #[arg(long = "bind", default_value = "0.0.0.0:8080", env = "BIND_ADDR")]
    bind: String,
    /// Address other nodes use to reach this one, e.g. ws://chat-1:8080.
    /// Defaults to ws://<hostname>:<port> on a wildcard bind
    #[arg(long = "advertise", env = "WEBSOCKET_SERVER")]
    advertise: Option<String>,
    /// Redis host (host:port or redis:// URL)
    #[arg(long = "redis", default_value = "127.0.0.1:6379", env = "REDIS_HOST")]
    redis: String,
    /// RocksDB data directory
    #[arg(long = "data-dir", default_value = "chatmesh_data", env = "CHATMESH_DATA_DIR")]
    data_dir: PathBuf,
    #[arg(long, value_enum, default_value_t = PresenceBackend::Redis)]
    presence: PresenceBackend,
    #[arg(long, value_enum, default_value_t = StoreBackend::Rocksdb)]
    store: StoreBackend,
    /// Push unread messages to users when they connect
    #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
    replay_backlog: bool,
    /// Close connections idle for this many seconds (0 = never)
    #[arg(long, default_value_t = 0)]
    idle_timeout_secs: u64,
}

impl Cli {
    fn node_config(&self) -> NodeConfig {
        NodeConfig {
            bind_addr: self.bind.clone(),
            advertise_addr: self.advertise.clone(),
            replay_backlog: self.replay_backlog,
            idle_timeout: (self.idle_timeout_secs > 0)
                .then(|| Duration::from_secs(self.idle_timeout_secs)),
            ..NodeConfig::default()
        }
    }
}

async fn open_presence(
    cli: &Cli,
) -> Result<Arc<dyn PresenceDirectory>, Box<dyn std::error::Error>> {
    let presence: Arc<dyn PresenceDirectory> = match cli.presence {
        PresenceBackend::Redis => Arc::new(RedisPresence::connect(&cli.redis).await?),
        PresenceBackend::Memory => {
            log::warn!("Using in-memory presence; other nodes will not see this node's users");
            Arc::new(MemoryPresence::new())
        }
    };
    Ok(presence)
}

fn open_store(cli: &Cli) -> Result<Arc<dyn MessageStore>, Box<dyn std::error::Error>> {
    let store: Arc<dyn MessageStore> = match cli.store {
        StoreBackend::Rocksdb => Arc::new(RocksMessageStore::open(StoreConfig {
            path: cli.data_dir.clone(),
            ..StoreConfig::default()
        })?),
        StoreBackend::Memory => {
            log::warn!("Using in-memory message store; messages are lost on exit");
            Arc::new(MemoryStore::new())
        }
    };
    Ok(store)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let presence = open_presence(&cli).await?;
    let store = open_store(&cli)?;

    let node = ChatNode::start(cli.node_config(), presence, store).await?;
    info!(
        "chatmesh-node {} up on {} as {}",
        env!("CARGO_PKG_VERSION"),
        node.local_addr(),
        node.advertise_addr()
    );

    let shutdown = node.shutdown_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Shutting down");
            shutdown.cancel();
        }
    });

    node.run().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_defaults() {
        let cli = Cli::parse_from(["chatmesh-node"]);
        let config = cli.node_config();
        assert!(config.replay_backlog);
        assert!(config.idle_timeout.is_none());
        assert!(matches!(cli.presence, PresenceBackend::Redis));
        assert!(matches!(cli.store, StoreBackend::Rocksdb));
    }

    #[test]
    fn test_cli_flags() {
        let cli = Cli::parse_from([
            "chatmesh-node",
            "--bind",
            "127.0.0.1:9000",
            "--advertise",
            "ws://chat-2:9000",
            "--presence",
            "memory",
            "--store",
            "memory",
            "--replay-backlog",
            "false",
            "--idle-timeout-secs",
            "30",
        ]);
        let config = cli.node_config();
        assert_eq!(config.bind_addr, "127.0.0.1:9000");
        assert_eq!(config.advertise_addr.as_deref(), Some("ws://chat-2:9000"));
        assert!(!config.replay_backlog);
        assert_eq!(config.idle_timeout, Some(Duration::from_secs(30)));
    }
}
