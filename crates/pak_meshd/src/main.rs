use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use pak_crypto::IdentityKeyPair;
use pak_mesh::{
    spawn_maintenance_loop, EventBus, LoopbackHub, MaintenanceHandle, MeshConfig, MeshEvent,
    MeshNode,
};
use pak_store::{MemoryStore, MeshStore, Priority, Store, Vault};
use tokio::sync::broadcast;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(author, version, about = "PakConnect mesh simulator", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run a line of in-process nodes and push messages end to end
    Simulate {
        #[arg(long, default_value_t = 3)]
        nodes: usize,
        #[arg(long, default_value_t = 5)]
        messages: usize,
        /// JSON config file; falls back to PAK_MESH_CONFIG, then defaults
        #[arg(long)]
        config: Option<PathBuf>,
        /// Persist each node in an encrypted SQLite database under this directory
        #[arg(long)]
        data_dir: Option<PathBuf>,
        #[arg(long, default_value = "pak-meshd")]
        passphrase: String,
        #[arg(long, default_value_t = 30)]
        timeout_secs: u64,
    },
    /// Print the effective configuration
    Config {
        #[arg(long)]
        config: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("pak_mesh=info,pak_store=info,pak_meshd=info")),
        )
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Simulate {
            nodes,
            messages,
            config,
            data_dir,
            passphrase,
            timeout_secs,
        } => {
            let config = load_config(config.as_deref())?;
            simulate(
                config,
                nodes,
                messages,
                data_dir.as_deref(),
                &passphrase,
                Duration::from_secs(timeout_secs),
            )
            .await
        }
        Commands::Config { config } => {
            let config = load_config(config.as_deref())?;
            println!("{}", serde_json::to_string_pretty(&config)?);
            Ok(())
        }
    }
}

fn load_config(path: Option<&Path>) -> Result<MeshConfig> {
    let config = match path {
        Some(p) => MeshConfig::load(p)?,
        None => MeshConfig::from_env()?,
    };
    Ok(config)
}

struct SimNode {
    node: Arc<MeshNode>,
    events: broadcast::Receiver<MeshEvent>,
    maintenance: MaintenanceHandle,
}

async fn start_node<S: MeshStore + 'static>(
    hub: &Arc<LoopbackHub>,
    name: &str,
    mut config: MeshConfig,
    store: Arc<S>,
) -> Result<SimNode> {
    config.node.display_name = name.to_owned();
    let (transport, rx) = hub.register(name);
    let bus = EventBus::new();
    let events = bus.subscribe();
    let identity = Arc::new(IdentityKeyPair::generate()?);
    let node = MeshNode::start(config, identity, transport, store, bus).await?;
    node.spawn(rx);
    let (_, maintenance) = spawn_maintenance_loop(node.clone());
    info!(name, id = %node.local_id(), "node started");
    Ok(SimNode {
        node,
        events,
        maintenance,
    })
}

async fn open_store(dir: &Path, name: &str, passphrase: &str) -> Result<Arc<Store>> {
    std::fs::create_dir_all(dir)?;
    let salt_path = dir.join(format!("{name}.salt"));
    let salt: [u8; 16] = if salt_path.exists() {
        let raw = std::fs::read_to_string(&salt_path)?;
        hex::decode(raw.trim())?
            .try_into()
            .map_err(|_| anyhow!("corrupt salt file {}", salt_path.display()))?
    } else {
        let salt = pak_store::vault::new_vault_salt();
        std::fs::write(&salt_path, hex::encode(salt))?;
        salt
    };
    let vault = Vault::new();
    vault.unlock(passphrase.as_bytes(), &salt).await?;
    let store = Store::open(&dir.join(format!("{name}.db")), vault)
        .await
        .with_context(|| format!("opening store for {name}"))?;
    Ok(Arc::new(store))
}

async fn simulate(
    config: MeshConfig,
    nodes: usize,
    messages: usize,
    data_dir: Option<&Path>,
    passphrase: &str,
    timeout: Duration,
) -> Result<()> {
    if nodes < 2 {
        return Err(anyhow!("need at least two nodes"));
    }
    let hops = nodes - 1;
    let mut config = config;
    if (config.relay.default_ttl as usize) < hops {
        warn!(ttl = config.relay.default_ttl, hops, "raising default TTL to span the line");
        config.relay.default_ttl = hops.min(u8::MAX as usize) as u8;
    }

    let hub = LoopbackHub::new();
    let mut sim = Vec::with_capacity(nodes);
    for i in 0..nodes {
        let name = format!("node-{i}");
        let node = match data_dir {
            Some(dir) => {
                let store = open_store(dir, &name, passphrase).await?;
                start_node(&hub, &name, config.clone(), store).await?
            }
            None => start_node(&hub, &name, config.clone(), Arc::new(MemoryStore::new())).await?,
        };
        sim.push(node);
    }

    // Line topology: node-0 - node-1 - ... - node-(n-1).
    for i in 1..nodes {
        let (left, right) = (format!("node-{}", i - 1), format!("node-{i}"));
        hub.connect(&left, &right, 185)?;
        let right_id = sim[i].node.local_id().to_owned();
        wait_for(&mut sim[i - 1].events, timeout, |e| {
            matches!(e, MeshEvent::PeerPromoted { new_key, .. } if *new_key == right_id)
        })
        .await
        .with_context(|| format!("{left} never linked to {right}"))?;
    }

    let recipient = sim[nodes - 1].node.local_id().to_owned();
    let mut sent = Vec::with_capacity(messages);
    for i in 0..messages {
        let body = format!("simulated message {i}");
        let id = sim[0]
            .node
            .send_message(&recipient, body.as_bytes(), Priority::Normal)
            .await?;
        sent.push(id);
    }
    info!(count = sent.len(), hops, "messages sent");

    let mut delivered = 0;
    while delivered < sent.len() {
        match wait_for(&mut sim[nodes - 1].events, timeout, |e| {
            matches!(e, MeshEvent::MessageDelivered { .. })
        })
        .await
        {
            Ok(_) => delivered += 1,
            Err(e) => {
                warn!(delivered, expected = sent.len(), error = %e, "stopped waiting for deliveries");
                break;
            }
        }
    }
    info!(delivered, expected = sent.len(), "simulation finished");

    for (i, s) in sim.iter().enumerate() {
        let stats = s.node.relay_stats();
        println!(
            "{}",
            serde_json::json!({
                "node": format!("node-{i}"),
                "id": s.node.local_id(),
                "stats": stats,
            })
        );
        s.maintenance.shutdown();
    }

    if delivered < sent.len() {
        return Err(anyhow!("{} of {} messages delivered", delivered, sent.len()));
    }
    Ok(())
}

async fn wait_for<F>(
    rx: &mut broadcast::Receiver<MeshEvent>,
    within: Duration,
    mut pred: F,
) -> Result<MeshEvent>
where
    F: FnMut(&MeshEvent) -> bool,
{
    tokio::time::timeout(within, async {
        loop {
            match rx.recv().await {
                Ok(event) if pred(&event) => return Ok(event),
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return Err(anyhow!("event bus closed")),
            }
        }
    })
    .await
    .map_err(|_| anyhow!("timed out after {}s", within.as_secs()))?
}
