use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use arc_swap::ArcSwap;
use bytes::Bytes;
use hickory_proto::rr::RecordType;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::cache::{CacheKey, CacheStore};
use crate::config::Settings;
use crate::wire::{self, DnsQuery, Header, WireError};

/// How a single request was served.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Synthetic response built from this many cached entries.
    Hit { answers: usize },
    /// Upstream reply relayed verbatim; this many records were cached from it.
    Forwarded { cached: usize },
}

#[derive(Clone)]
pub struct Engine {
    settings: Arc<ArcSwap<Settings>>,
    store: Arc<CacheStore>,
    max_datagram_size: usize,
}

impl Engine {
    pub fn new(settings: Arc<ArcSwap<Settings>>, store: Arc<CacheStore>) -> Self {
        let max_datagram_size = settings.load().max_datagram_size;
        Self {
            settings,
            store,
            max_datagram_size,
        }
    }

    pub fn store(&self) -> &Arc<CacheStore> {
        &self.store
    }

    /// 处理单个数据报，错误只影响本请求，不会终止监听循环
    pub async fn handle_datagram(&self, socket: &UdpSocket, packet: &[u8], peer: SocketAddr) {
        match self.handle_packet(socket, packet, peer).await {
            Ok(outcome) => debug!(%peer, ?outcome, "request done"),
            Err(err) if err.downcast_ref::<WireError>().is_some() => {
                debug!(%peer, error = %err, packet = %hex::encode(packet), "dropping malformed query");
            }
            Err(err) => {
                warn!(%peer, error = %format!("{err:#}"), "request aborted");
            }
        }
    }

    /// decode → cache lookup → hit: synthetic reply; miss: forward, relay, then cache the answers.
    pub async fn handle_packet(
        &self,
        socket: &UdpSocket,
        packet: &[u8],
        peer: SocketAddr,
    ) -> anyhow::Result<Outcome> {
        let query = wire::decode_query(packet).context("decode query")?;
        let qtype = RecordType::from(query.qtype);
        debug!(
            qname = %query.name,
            %qtype,
            qclass = query.qclass,
            qr = query.header.flags.is_response(),
            opcode = query.header.flags.opcode(),
            rd = query.header.flags.recursion_desired(),
            "query decoded"
        );

        match self.answer_from_cache(&query, packet) {
            Ok(Some((resp, answers))) => {
                info!(qname = %query.name, %qtype, %peer, answers, "cache hit");
                socket
                    .send_to(&resp, peer)
                    .await
                    .context("send cached response")?;
                return Ok(Outcome::Hit { answers });
            }
            Ok(None) => {}
            // unusable cached entries: fall through to the upstream
            Err(err) => {
                warn!(qname = %query.name, %qtype, %peer, error = %err, "cached entries unusable, forwarding");
            }
        }

        info!(qname = %query.name, %qtype, %peer, "cache miss");
        let settings = self.settings.load_full();
        let upstream = settings.upstream_addr()?;
        let reply = forward_udp(
            packet,
            upstream,
            settings.upstream_timeout(),
            self.max_datagram_size,
        )
        .await
        .with_context(|| format!("upstream {upstream}"))?;

        socket
            .send_to(&reply, peer)
            .await
            .context("relay upstream response")?;

        let cached = self.absorb(&reply);
        Ok(Outcome::Forwarded { cached })
    }

    /// Synthetic response and its answer count when `query` has live cache entries.
    pub fn answer_from_cache(
        &self,
        query: &DnsQuery,
        packet: &[u8],
    ) -> Result<Option<(Bytes, usize)>, WireError> {
        let key = CacheKey::new(query.qtype, query.name.clone());
        let live = self.store.lookup(&key);
        if live.is_empty() {
            return Ok(None);
        }
        let resp = wire::build_response(query.id(), packet, live.iter().map(|e| &e.record))?;
        Ok(Some((resp, live.len())))
    }

    /// Caches every answer record of an upstream reply.
    pub fn absorb(&self, reply: &[u8]) -> usize {
        let records = wire::extract_records(reply);
        let count = records.len();
        for record in records {
            self.store.insert(record);
        }
        if let Ok(header) = Header::parse(reply) {
            debug!(rcode = header.flags.rcode(), answers = header.an_count, cached = count, "upstream reply absorbed");
        }
        count
    }
}

/// 每次未命中使用新的 UDP socket 转发到上游，超时即放弃，不重试
async fn forward_udp(
    packet: &[u8],
    upstream: SocketAddr,
    timeout_dur: Duration,
    max_datagram_size: usize,
) -> anyhow::Result<Bytes> {
    let (domain, local): (Domain, SocketAddr) = if upstream.is_ipv4() {
        (Domain::IPV4, (Ipv4Addr::UNSPECIFIED, 0).into())
    } else {
        (Domain::IPV6, (Ipv6Addr::UNSPECIFIED, 0).into())
    };
    let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP)).context("create socket")?;
    socket.bind(&local.into()).context("bind")?;
    socket.set_nonblocking(true).context("set nonblocking")?;
    let sock = UdpSocket::from_std(socket.into()).context("from_std")?;

    sock.connect(upstream).await.context("connect upstream")?;
    sock.send(packet).await.context("send to upstream")?;

    let mut buf = vec![0u8; max_datagram_size];
    let recv_res = timeout(timeout_dur, async {
        loop {
            let size = sock.recv(&mut buf).await?;
            // Connected socket: only the upstream reaches us. Skip anything not
            // carrying our transaction id.
            if size >= 2 && buf[..2] == packet[..2] {
                return Ok::<_, anyhow::Error>(Bytes::copy_from_slice(&buf[..size]));
            }
        }
    })
    .await;

    match recv_res {
        Ok(res) => res,
        Err(_) => anyhow::bail!("upstream timeout after {}ms", timeout_dur.as_millis()),
    }
}
