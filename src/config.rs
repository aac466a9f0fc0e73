use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use anyhow::Result;
use serde::Deserialize;
use tracing::info;

#[derive(Debug, Clone, Deserialize, Default)]
pub struct ProxyConfig {
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub settings: Settings,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct Settings {
    /// UDP监听地址，缺省0.0.0.0:53（需要权限）。
    #[serde(default = "default_bind_udp")]
    pub bind_udp: String,
    /// 上游DNS，仅一个，不做故障切换。
    #[serde(default = "default_upstream")]
    pub upstream: String,
    /// 上游超时（毫秒）。
    #[serde(default = "default_upstream_timeout_ms")]
    pub upstream_timeout_ms: u64,
    /// 缓存快照文件。
    #[serde(default = "default_cache_file")]
    pub cache_file: PathBuf,
    /// 过期清理间隔（秒），每次清理后落盘。
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
    /// 单个 UDP 数据报的最大字节数。
    #[serde(default = "default_max_datagram_size")]
    pub max_datagram_size: usize,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            bind_udp: default_bind_udp(),
            upstream: default_upstream(),
            upstream_timeout_ms: default_upstream_timeout_ms(),
            cache_file: default_cache_file(),
            sweep_interval_secs: default_sweep_interval_secs(),
            max_datagram_size: default_max_datagram_size(),
        }
    }
}

impl Settings {
    pub fn bind_addr(&self) -> Result<SocketAddr> {
        self.bind_udp
            .parse()
            .with_context(|| format!("parse bind_udp: {}", self.bind_udp))
    }

    pub fn upstream_addr(&self) -> Result<SocketAddr> {
        self.upstream
            .parse()
            .with_context(|| format!("parse upstream: {}", self.upstream))
    }

    #[inline]
    pub fn upstream_timeout(&self) -> Duration {
        Duration::from_millis(self.upstream_timeout_ms)
    }

    #[inline]
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    /// Fields that only take effect at startup.
    pub fn restart_required(&self, other: &Settings) -> bool {
        self.bind_udp != other.bind_udp
            || self.cache_file != other.cache_file
            || self.sweep_interval_secs != other.sweep_interval_secs
            || self.max_datagram_size != other.max_datagram_size
    }

    fn validate(&self) -> Result<()> {
        self.bind_addr()?;
        self.upstream_addr()?;
        if self.sweep_interval_secs == 0 {
            anyhow::bail!("sweep_interval_secs must be positive");
        }
        if self.max_datagram_size < crate::wire::HEADER_LEN {
            anyhow::bail!(
                "max_datagram_size {} cannot hold a dns header",
                self.max_datagram_size
            );
        }
        Ok(())
    }
}

pub fn load_config(path: &Path) -> Result<ProxyConfig> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("read config file: {}", path.display()))?;
    let cfg: ProxyConfig = serde_json::from_str(&raw)
        .with_context(|| format!("parse config file: {}", path.display()))?;

    if let Some(version) = cfg.version.as_ref() {
        info!(target = "config", version = %version, "config loaded");
    }

    cfg.settings
        .validate()
        .with_context(|| format!("validate config file: {}", path.display()))?;
    Ok(cfg)
}


fn default_bind_udp() -> String {
    "0.0.0.0:53".to_string()
}

fn default_upstream() -> String {
    "8.8.8.8:53".to_string()
}

fn default_upstream_timeout_ms() -> u64 {
    5000
}

fn default_cache_file() -> PathBuf {
    PathBuf::from("cache.json")
}

fn default_sweep_interval_secs() -> u64 {
    60
}

fn default_max_datagram_size() -> usize {
    4096
}
