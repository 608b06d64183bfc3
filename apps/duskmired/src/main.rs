use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::{watch, Mutex};
use tracing::{error, info, warn, Level};

mod catalog;
mod combat;
mod gateway;
mod items;
mod loot;
mod monsters;
mod movement;
mod persist;
mod skills;
mod world;

use catalog::Catalog;
use gateway::Shared;
use persist::Store;
use world::{Rng64, World};

fn usage_and_exit() -> ! {
    eprintln!(
        "duskmired (authoritative world server)\n\n\
USAGE:\n  duskmired [--bind HOST:PORT] [--content DIR] [--data DIR] [--seed N]\n\n\
ENV:\n  DUSKMIRE_BIND              default 0.0.0.0:4500\n  DUSKMIRE_CONTENT_DIR       default content\n  DUSKMIRE_DATA_DIR          default data\n  DUSKMIRE_WORLD_SEED        default 1\n  DUSKMIRE_READ_TIMEOUT_S    default 120\n  DUSKMIRE_COMBAT_LOG_DAYS   default 30\n"
    );
    std::process::exit(2);
}

#[derive(Clone, Debug)]
struct Config {
    bind: SocketAddr,
    content_dir: PathBuf,
    data_dir: PathBuf,
    world_seed: u64,
    read_timeout_s: u64,
    combat_log_days: u32,
}

fn parse_args() -> Config {
    let mut bind: SocketAddr = std::env::var("DUSKMIRE_BIND")
        .unwrap_or_else(|_| "0.0.0.0:4500".to_string())
        .parse()
        .unwrap_or_else(|_| usage_and_exit());
    let mut content_dir =
        PathBuf::from(std::env::var("DUSKMIRE_CONTENT_DIR").unwrap_or_else(|_| "content".to_string()));
    let mut data_dir =
        PathBuf::from(std::env::var("DUSKMIRE_DATA_DIR").unwrap_or_else(|_| "data".to_string()));
    let mut world_seed: u64 = std::env::var("DUSKMIRE_WORLD_SEED")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(1);
    let read_timeout_s: u64 = std::env::var("DUSKMIRE_READ_TIMEOUT_S")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(120);
    let combat_log_days: u32 = std::env::var("DUSKMIRE_COMBAT_LOG_DAYS")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(30);

    let mut it = std::env::args().skip(1);
    while let Some(arg) = it.next() {
        match arg.as_str() {
            "--bind" => {
                let v = it.next().unwrap_or_else(|| usage_and_exit());
                bind = v.parse().unwrap_or_else(|_| usage_and_exit());
            }
            "--content" => {
                content_dir = PathBuf::from(it.next().unwrap_or_else(|| usage_and_exit()));
            }
            "--data" => {
                data_dir = PathBuf::from(it.next().unwrap_or_else(|| usage_and_exit()));
            }
            "--seed" => {
                let v = it.next().unwrap_or_else(|| usage_and_exit());
                world_seed = v.parse().unwrap_or_else(|_| usage_and_exit());
            }
            "-h" | "--help" => usage_and_exit(),
            _ => usage_and_exit(),
        }
    }

    Config {
        bind,
        content_dir,
        data_dir,
        world_seed,
        read_timeout_s,
        combat_log_days,
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,duskmired=info".into()),
        )
        .with_target(false)
        .with_max_level(Level::INFO)
        .init();

    let cfg = parse_args();

    let catalog = Arc::new(Catalog::load(&cfg.content_dir)?);
    info!(
        content = %cfg.content_dir.display(),
        items = catalog.items.len(),
        monsters = catalog.monsters.len(),
        skills = catalog.skills.len(),
        classes = catalog.classes.len(),
        "catalog loaded"
    );

    // A dead store degrades the server instead of killing it: catalog
    // traffic keeps working, login and register refuse.
    let (store, degraded) = match Store::open(&cfg.data_dir) {
        Ok(s) => {
            let (ok, msg) = s.health_check().await;
            if !ok {
                error!(detail = %msg, "store unhealthy; running degraded");
            }
            (Arc::new(s), !ok)
        }
        Err(e) => {
            error!(err = %e, "store unavailable; running degraded");
            let fallback = std::env::temp_dir().join("duskmired-degraded");
            (Arc::new(Store::open(fallback)?), true)
        }
    };

    let mut world = World::new(catalog.clone(), cfg.world_seed);
    let mut persisted = store.load_monster_instances().await;
    if persisted.is_empty() {
        let mut seed_rng = Rng64::from_seed(cfg.world_seed ^ 0xD05);
        let seeded = World::seed_monster_records(&catalog, &mut seed_rng);
        if let Err(e) = store.seed_monster_instances(seeded.clone()).await {
            warn!(err = %e, "monster seed persist failed");
        }
        persisted = seeded;
    }
    world.load_monsters(&persisted);
    match store.allocate_item_ids(256).await {
        Ok(range) => world.item_id_pool = range,
        Err(e) => warn!(err = %e, "initial item id pool allocation failed"),
    }
    info!(monsters = world.monsters.len(), seed = cfg.world_seed, "world initialized");

    if let Err(e) = store.clean_old_combat_logs(cfg.combat_log_days) {
        warn!(err = %e, "combat log cleanup failed");
    }

    let shared = Arc::new(Shared {
        catalog,
        store,
        world: Mutex::new(world),
        sessions: Mutex::new(HashMap::new()),
        degraded,
        read_timeout: Duration::from_secs(cfg.read_timeout_s.max(1)),
    });

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let ticker = tokio::spawn(gateway::run_world_loop(shared.clone(), shutdown_rx));

    let listener = TcpListener::bind(cfg.bind).await?;
    info!(bind = %cfg.bind, degraded, "duskmired listening");

    loop {
        tokio::select! {
            res = listener.accept() => {
                let (stream, peer) = res?;
                let shared = shared.clone();
                tokio::spawn(async move {
                    if let Err(e) = gateway::handle_conn(shared, stream, peer).await {
                        warn!(peer = %peer, err = %e, "connection ended with error");
                    }
                });
            }
            _ = tokio::signal::ctrl_c() => {
                info!("shutdown requested");
                break;
            }
        }
    }

    // Orderly shutdown: stop the tick, then flush every active character
    // and monster synchronously before exit.
    let _ = shutdown_tx.send(true);
    let _ = ticker.await;
    gateway::final_persist(&shared).await;
    info!("bye");
    Ok(())
}
