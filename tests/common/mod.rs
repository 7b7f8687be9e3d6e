#![allow(dead_code)]

use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use socket_mpi::{Config, LaunchArgs, Topology, World};

static NEXT_FILE: AtomicUsize = AtomicUsize::new(0);

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// A rendezvous path no other test uses.
pub fn rendezvous_path(name: &str) -> PathBuf {
    let n = NEXT_FILE.fetch_add(1, Ordering::SeqCst);
    let path = std::env::temp_dir().join(format!(
        "socket-mpi-{}-{}-{}.ports",
        name,
        std::process::id(),
        n
    ));
    let _ = std::fs::remove_file(&path);
    path
}

pub fn test_config() -> Config {
    Config {
        discovery_attempts: Some(500),
        discovery_interval: Duration::from_millis(10),
        finalize_grace: Duration::from_millis(20),
        hostname: Some("localhost".to_string()),
        ..Config::default()
    }
}

pub fn launch_args(rank: usize, size: usize, path: &PathBuf) -> LaunchArgs {
    LaunchArgs {
        rank,
        size,
        rendezvous_path: path.to_string_lossy().into_owned(),
    }
}

/// Start one thread per rank, each running `body` on its own `World`.
pub fn spawn_ranks<F, R>(size: usize, path: &PathBuf, config: Config, body: F) -> Vec<JoinHandle<R>>
where
    F: Fn(usize, socket_mpi::Result<World>) -> R + Send + Sync + 'static,
    R: Send + 'static,
{
    let body = Arc::new(body);
    (0..size)
        .map(|rank| {
            let body = Arc::clone(&body);
            let args = launch_args(rank, size, path);
            let config = config.clone();
            std::thread::spawn(move || {
                let world = Topology::paired(size)
                    .and_then(|topology| World::init_with_topology(&args, topology, config));
                body(rank, world)
            })
        })
        .collect()
}

/// Run `body` on every rank between a successful init and a successful finalize, and
/// return each rank's result in rank order.
pub fn run_world<F, R>(size: usize, name: &str, body: F) -> Vec<R>
where
    F: Fn(&World) -> R + Send + Sync + 'static,
    R: Send + 'static,
{
    run_world_with(size, name, test_config(), body)
}

pub fn run_world_with<F, R>(size: usize, name: &str, config: Config, body: F) -> Vec<R>
where
    F: Fn(&World) -> R + Send + Sync + 'static,
    R: Send + 'static,
{
    init_logging();
    let path = rendezvous_path(name);
    let handles = spawn_ranks(size, &path, config, move |rank, world| {
        let world = world.unwrap_or_else(|e| panic!("rank {} init failed: {}", rank, e));
        let out = body(&world);
        world
            .finalize()
            .unwrap_or_else(|e| panic!("rank {} finalize failed: {}", rank, e));
        out
    });
    let results = handles.into_iter().map(|h| h.join().unwrap()).collect();
    assert!(!path.exists(), "rendezvous file left behind at {}", path.display());
    results
}
