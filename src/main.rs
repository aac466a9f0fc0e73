mod cache;
mod config;
mod engine;
mod watcher;
mod wire;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use arc_swap::ArcSwap;
use bytes::BytesMut;
use clap::Parser;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use crate::cache::{CacheStore, spawn_sweeper};
use crate::config::{Settings, load_config};
use crate::engine::Engine;

#[derive(Parser, Debug)]
#[command(author, version, about = "Caching DNS forwarder with a persisted TTL cache", long_about = None)]
struct Args {
    /// 配置文件路径（JSON），缺省使用内置默认值
    #[arg(short = 'c', long = "config")]
    config: Option<PathBuf>,
    /// 启用调试日志
    #[arg(long = "debug", default_value_t = false)]
    debug: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(args.debug);

    let settings = match &args.config {
        Some(path) => load_config(path).context("load initial config")?.settings,
        None => Settings::default(),
    };
    let bind_addr = settings.bind_addr()?;
    let max_datagram_size = settings.max_datagram_size;

    let store = Arc::new(CacheStore::load(settings.cache_file.clone()));
    let sweeper = spawn_sweeper(Arc::clone(&store), settings.sweep_interval());

    let upstream = settings.upstream.clone();
    let settings = Arc::new(ArcSwap::from_pointee(settings));
    if let Some(path) = args.config.clone() {
        watcher::spawn(path, Arc::clone(&settings));
    }
    let engine = Engine::new(settings, Arc::clone(&store));

    let socket = match bind_udp(bind_addr) {
        Ok(s) => Arc::new(s),
        Err(err) => {
            if let Some(io_err) = err.downcast_ref::<std::io::Error>() {
                if io_err.kind() == std::io::ErrorKind::PermissionDenied {
                    error!(bind_udp = %bind_addr, "binding a port below 1024 needs elevated privileges");
                }
            }
            error!(bind_udp = %bind_addr, error = %format!("{err:#}"), "cannot bind listener");
            return Err(err);
        }
    };

    info!(bind_udp = %bind_addr, upstream = %upstream, cached_keys = store.len(), "dns proxy started");

    tokio::select! {
        res = run_udp(socket, engine, max_datagram_size) => {
            if let Err(err) = res {
                error!(error = %err, "udp listener exited");
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown requested");
        }
    }

    shutdown(&store, sweeper).await?;
    Ok(())
}

/// 停止清理任务并做最后一次落盘
async fn shutdown(store: &CacheStore, sweeper: JoinHandle<()>) -> anyhow::Result<()> {
    sweeper.abort();
    let _ = sweeper.await;
    match store.persist().await {
        Ok(()) => {
            info!(path = %store.path().display(), keys = store.len(), "cache persisted");
            Ok(())
        }
        Err(err) => {
            warn!(error = %format!("{err:#}"), "final cache persist failed");
            Err(err)
        }
    }
}

fn init_tracing(debug: bool) {
    let fmt_layer = fmt::layer().with_target(false).with_ansi(false);

    let level = if debug { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .init();
}

fn bind_udp(addr: SocketAddr) -> anyhow::Result<UdpSocket> {
    let domain = if addr.is_ipv4() {
        Domain::IPV4
    } else {
        Domain::IPV6
    };
    let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP)).context("create socket")?;
    if let Err(e) = socket.set_recv_buffer_size(4 * 1024 * 1024) {
        warn!("failed to set udp recv buffer size: {}", e);
    }
    if let Err(e) = socket.set_send_buffer_size(4 * 1024 * 1024) {
        warn!("failed to set udp send buffer size: {}", e);
    }
    socket.set_nonblocking(true).context("set nonblocking")?;
    socket.bind(&addr.into())?;
    UdpSocket::from_std(socket.into()).context("from_std")
}

/// 接收循环：每个数据报一个任务，无并发上限
async fn run_udp(
    socket: Arc<UdpSocket>,
    engine: Engine,
    max_datagram_size: usize,
) -> anyhow::Result<()> {
    let mut buf = BytesMut::with_capacity(max_datagram_size);

    loop {
        buf.resize(max_datagram_size, 0);
        match socket.recv_from(&mut buf).await {
            Ok((len, peer)) => {
                buf.truncate(len);
                let packet = buf.split().freeze();
                let engine = engine.clone();
                let socket = Arc::clone(&socket);
                tokio::spawn(async move {
                    engine.handle_datagram(&socket, &packet, peer).await;
                });
            }
            Err(err) => {
                // 继续接收，不退出
                warn!(error = %err, "udp recv failed");
                buf.clear();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    #[tokio::test]
    async fn listener_survives_garbage_and_keeps_serving() {
        let dir = tempfile::tempdir().unwrap();
        let upstream = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let settings = Settings {
            bind_udp: "127.0.0.1:0".to_string(),
            upstream: upstream.local_addr().unwrap().to_string(),
            upstream_timeout_ms: 1000,
            cache_file: dir.path().join("cache.json"),
            ..Settings::default()
        };
        let socket = Arc::new(bind_udp(settings.bind_addr().unwrap()).unwrap());
        let proxy_addr = socket.local_addr().unwrap();
        let store = Arc::new(CacheStore::new(settings.cache_file.clone()));
        let engine = Engine::new(Arc::new(ArcSwap::from_pointee(settings)), Arc::clone(&store));
        let server = tokio::spawn(run_udp(socket, engine, 512));

        // upstream echoes the query back flagged as a response
        tokio::spawn(async move {
            let mut buf = [0u8; 512];
            while let Ok((len, peer)) = upstream.recv_from(&mut buf).await {
                let mut reply = buf[..len].to_vec();
                reply[2] |= 0x80;
                let _ = upstream.send_to(&reply, peer).await;
            }
        });

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        client.send_to(&[1, 2, 3], proxy_addr).await.unwrap();

        let mut query = vec![0xab, 0xcd, 0x01, 0x00, 0, 1, 0, 0, 0, 0, 0, 0];
        query.extend_from_slice(&[7, b'e', b'x', b'a', b'm', b'p', b'l', b'e', 3, b'c', b'o', b'm', 0, 0, 1, 0, 1]);
        client.send_to(&query, proxy_addr).await.unwrap();

        let mut buf = [0u8; 512];
        let (len, _) = timeout(Duration::from_secs(2), client.recv_from(&mut buf))
            .await
            .expect("reply before timeout")
            .unwrap();
        assert_eq!(&buf[..2], &[0xab, 0xcd]);
        assert_eq!(&buf[12..len], &query[12..]);
        assert!(store.is_empty());
        server.abort();
    }

    #[tokio::test]
    async fn shutdown_leaves_loadable_snapshot() {
        use crate::cache::CacheKey;
        use crate::wire::{CLASS_IN, ResourceRecord, rtype};

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache.json");
        let store = Arc::new(CacheStore::new(path.clone()));
        let record = |name: &str| ResourceRecord {
            name: name.to_string(),
            rtype: rtype::A,
            class: CLASS_IN,
            ttl: 3600,
            data: vec![1, 2, 3, 4],
        };
        for i in 0..100 {
            store.insert(record(&format!("early{i}.example")));
        }
        let sweeper = spawn_sweeper(Arc::clone(&store), Duration::from_millis(5));
        tokio::time::sleep(Duration::from_millis(30)).await;
        store.insert(record("late.example"));

        shutdown(&store, sweeper).await.expect("final persist");

        let loaded = CacheStore::load(&path);
        assert_eq!(loaded.len(), 101);
        assert_eq!(loaded.lookup(&CacheKey::new(rtype::A, "late.example")).len(), 1);
    }
}
