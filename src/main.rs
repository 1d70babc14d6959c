//! # veil-store デーモン
//!
//! ワーカースレッドごとに monoio (io_uring) ランタイムと `Controller` を起動し、
//! 共有ストアの同期と定期メンテナンスを行います。
//!
//! ## 設定
//!
//! ```toml
//! workers = 4
//!
//! [store]
//! memory_cache_size = 268435456
//! writer_lease_secs = 30
//! enable_purge = true
//!
//! [[store.disks]]
//! path = "/var/cache/veil/0"
//! ```

use mimalloc::MiMalloc;

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

use ftlog::{error, info, warn};
use monoio::time::sleep;
use monoio::RuntimeBuilder;
use serde::Deserialize;
use std::fs;
use std::io;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use veil_store::cache::{Controller, SharedStore, StoreConfig};

// 同期・メンテナンス間隔
const SYNC_INTERVAL: Duration = Duration::from_millis(100);
const MAINTENANCE_INTERVAL: Duration = Duration::from_secs(1);

// ====================
// Graceful Shutdown フラグ
// ====================

static SHUTDOWN_FLAG: AtomicBool = AtomicBool::new(false);

// ====================
// 設定
// ====================

#[derive(Deserialize, Default)]
struct Config {
    /// ワーカースレッド数（省略時はCPU数）
    #[serde(default)]
    workers: Option<usize>,
    #[serde(default)]
    store: StoreConfig,
}

fn load_config(path: &Path) -> io::Result<Config> {
    if !path.exists() {
        info!("{} not found, using defaults", path.display());
        return Ok(Config::default());
    }
    let config_str = fs::read_to_string(path)?;
    toml::from_str(&config_str)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, format!("TOML parse error: {}", e)))
}

fn main() {
    let _guard = match ftlog::Builder::new().try_init() {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("Logger init error: {}", e);
            return;
        }
    };

    let config = match load_config(Path::new("config.toml")) {
        Ok(c) => c,
        Err(e) => {
            error!("Config load error: {}", e);
            return;
        }
    };

    let shared = match SharedStore::new(config.store.clone()) {
        Ok(s) => Arc::new(s),
        Err(e) => {
            error!("Store open error: {}", e);
            return;
        }
    };

    let hostname = hostname::get()
        .map(|h| h.to_string_lossy().into_owned())
        .unwrap_or_else(|_| "unknown".to_string());
    let num_threads = config.workers.unwrap_or_else(num_cpus::get).max(1);

    info!("============================================");
    info!("HTTP Object Store");
    info!("Hostname: {}", hostname);
    info!("Workers: {}", num_threads);
    info!("Memory: {} bytes ({} byte pages)", config.store.memory_cache_size, config.store.memory_page_size);
    info!("Disks: {}", config.store.disks.len());
    info!("Collapsed Forwarding: {}", config.store.collapsed_forwarding);
    info!("Writer Lease: {}s", config.store.writer_lease_secs);
    info!("============================================");

    // Graceful Shutdown用のシグナルハンドラを設定
    setup_signal_handler();

    let mut handles = Vec::with_capacity(num_threads);

    for thread_id in 0..num_threads {
        let shared = Arc::clone(&shared);

        let handle = thread::spawn(move || {
            let mut rt = match RuntimeBuilder::<monoio::IoUringDriver>::new().enable_timer().build() {
                Ok(rt) => rt,
                Err(e) => {
                    error!("[Thread {}] Runtime error: {}", thread_id, e);
                    return;
                }
            };
            rt.block_on(async move {
                let controller = Controller::new(thread_id as u32, shared);
                let mut last_maintenance = Instant::now();
                info!("[Thread {}] Worker started", thread_id);

                loop {
                    if SHUTDOWN_FLAG.load(Ordering::Relaxed) {
                        info!("[Thread {}] Shutting down...", thread_id);
                        break;
                    }

                    sleep(SYNC_INTERVAL).await;
                    controller.sync();

                    if last_maintenance.elapsed() >= MAINTENANCE_INTERVAL {
                        controller.maintain();
                        last_maintenance = Instant::now();
                    }
                }

                let stats = controller.stats();
                info!(
                    "[Thread {}] Worker stopped: {} local entries, hits {}, misses {}, collapsed {}, hit rate {:.1}%",
                    thread_id, stats.entries, stats.hits, stats.misses, stats.collapsed, stats.hit_rate
                );
            });
        });
        handles.push(handle);
    }

    for handle in handles {
        let _ = handle.join();
    }

    let controller = Controller::new(u32::MAX, shared);
    let stats = controller.stats();
    info!(
        "Store shutdown complete: memory {}/{} bytes ({} objects), disk {}/{} bytes ({} objects), uptime {}s",
        stats.memory_usage,
        stats.memory_capacity,
        stats.memory_objects,
        stats.disk_usage,
        stats.disk_capacity,
        stats.disk_objects,
        stats.uptime_secs
    );
}

/// シグナルハンドラのセットアップ
fn setup_signal_handler() {
    // SIGINT, SIGTERM をキャッチしてシャットダウンフラグを設定
    if let Err(e) = ctrlc::set_handler(move || {
        info!("Received shutdown signal, initiating graceful shutdown...");
        SHUTDOWN_FLAG.store(true, Ordering::SeqCst);
    }) {
        warn!("Failed to set signal handler: {}", e);
    }
}
