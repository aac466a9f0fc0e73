use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use arc_swap::ArcSwap;
use notify::{Config, RecommendedWatcher, RecursiveMode, Watcher};
use tracing::{error, info, warn};

use crate::config::{self, Settings};

pub fn spawn(path: PathBuf, settings: Arc<ArcSwap<Settings>>) {
    // 使用阻塞线程持有watcher，避免异步生命周期问题。
    thread::spawn(move || {
        if let Err(err) = run_watcher(path, settings) {
            error!(target = "watcher", error = %err, "config watcher exited with error");
        }
    });
}

fn run_watcher(path: PathBuf, settings: Arc<ArcSwap<Settings>>) -> notify::Result<()> {
    let (tx, rx) = std::sync::mpsc::channel();
    let mut watcher: RecommendedWatcher = Watcher::new(tx, Config::default())?;
    watcher.watch(&path, RecursiveMode::NonRecursive)?;

    info!(target = "watcher", path = %path.display(), "config watcher started");

    for res in rx {
        match res {
            Ok(_event) => reload(&path, &settings),
            Err(err) => {
                warn!(target = "watcher", error = %err, "watcher event error");
            }
        }
    }
    Ok(())
}

/// Retries a few times to ride out truncate-then-write races; keeps the old
/// settings if the file never parses.
pub fn reload(path: &Path, settings: &ArcSwap<Settings>) {
    let mut retries = 3;
    while retries > 0 {
        match config::load_config(path) {
            Ok(cfg) => {
                let new = cfg.settings;
                if settings.load().restart_required(&new) {
                    warn!(
                        target = "watcher",
                        path = %path.display(),
                        "bind_udp, cache_file, sweep_interval_secs and max_datagram_size apply after restart"
                    );
                }
                info!(target = "watcher", path = %path.display(), upstream = %new.upstream, "config reloaded");
                settings.store(Arc::new(new));
                return;
            }
            Err(err) => {
                retries -= 1;
                if retries == 0 {
                    warn!(target = "watcher", path = %path.display(), error = %err, "config reload failed, keeping old config");
                } else {
                    thread::sleep(Duration::from_millis(50));
                }
            }
        }
    }
}
