//! StatsD over UDP
//!
//! Each flushed event becomes one datagram holding its StatsD lines, with the
//! configured prefix prepended to every metric name and the global tags
//! appended in DogStatsD `|#k:v` form.

use super::{Transport, TransportError};
use crate::event::Event;
use bytes::{BufMut, BytesMut};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::net::UdpSocket;
use tracing::debug;

const DEFAULT_STATSD_ADDR: &str = "127.0.0.1:8125";

/// StatsD endpoint configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UdpTransportConfig {
    /// StatsD collector address (default: 127.0.0.1:8125)
    pub addr: SocketAddr,
    /// Prepended to every metric name, e.g. "myapp."
    pub prefix: String,
    /// Global tags appended to every line
    pub tags: Vec<(String, String)>,
}

impl Default for UdpTransportConfig {
    fn default() -> Self {
        UdpTransportConfig {
            addr: default_addr(),
            prefix: String::new(),
            tags: Vec::new(),
        }
    }
}

fn default_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 8125))
}

impl UdpTransportConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Self {
        let mut config = UdpTransportConfig::default();
        config.apply_env();
        config
    }

    /// Override fields with any of `STATSD_ADDR`, `STATSD_PREFIX`, `STATSD_TAGS` that are set
    pub fn apply_env(&mut self) {
        if let Ok(addr) = std::env::var("STATSD_ADDR") {
            self.addr = addr.parse().unwrap_or_else(|_| {
                tracing::warn!(
                    "Invalid STATSD_ADDR '{}', using {}",
                    addr,
                    DEFAULT_STATSD_ADDR
                );
                default_addr()
            });
        }
        if let Ok(prefix) = std::env::var("STATSD_PREFIX") {
            self.prefix = prefix;
        }
        if let Ok(tags) = std::env::var("STATSD_TAGS") {
            self.tags = parse_tags(&tags);
        }
    }

    /// Tag suffix in DogStatsD form, empty when there are no tags
    pub fn tag_suffix(&self) -> String {
        if self.tags.is_empty() {
            return String::new();
        }
        let tags: Vec<String> = self
            .tags
            .iter()
            .map(|(k, v)| format!("{}:{}", k, v))
            .collect();
        format!("|#{}", tags.join(","))
    }
}

/// Parse "key1:value1,key2:value2"
pub fn parse_tags(s: &str) -> Vec<(String, String)> {
    s.split(',')
        .filter(|s| !s.is_empty())
        .filter_map(|tag| {
            let mut parts = tag.splitn(2, ':');
            let key = parts.next()?.trim();
            let value = parts.next()?.trim();
            if key.is_empty() || value.is_empty() {
                None
            } else {
                Some((key.to_string(), value.to_string()))
            }
        })
        .collect()
}

/// UDP StatsD transport
pub struct UdpTransport {
    socket: UdpSocket,
    prefix: String,
    tag_suffix: String,
    closed: AtomicBool,
}

impl UdpTransport {
    /// Bind an ephemeral local socket and connect it to the collector
    pub async fn connect(config: &UdpTransportConfig) -> Result<Self, TransportError> {
        let bind_addr: SocketAddr = if config.addr.is_ipv4() {
            SocketAddr::from(([0, 0, 0, 0], 0))
        } else {
            SocketAddr::from(([0u16; 8], 0))
        };
        let socket = UdpSocket::bind(bind_addr).await?;
        socket.connect(config.addr).await?;
        debug!("StatsD UDP transport connected to {}", config.addr);

        Ok(UdpTransport {
            socket,
            prefix: config.prefix.clone(),
            tag_suffix: config.tag_suffix(),
            closed: AtomicBool::new(false),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, TransportError> {
        Ok(self.socket.local_addr()?)
    }

    /// Encode an event into one newline-separated datagram
    pub fn encode(&self, event: &Event) -> BytesMut {
        encode_lines(event, &self.prefix, &self.tag_suffix)
    }
}

fn encode_lines(event: &Event, prefix: &str, tag_suffix: &str) -> BytesMut {
    let lines = event.stats();
    let mut buf = BytesMut::with_capacity(lines.iter().map(|l| l.len() + 1).sum::<usize>() * 2);
    for (i, line) in lines.iter().enumerate() {
        if i > 0 {
            buf.put_u8(b'\n');
        }
        buf.put_slice(prefix.as_bytes());
        buf.put_slice(line.as_bytes());
        buf.put_slice(tag_suffix.as_bytes());
    }
    buf
}

impl Transport for UdpTransport {
    fn send<'a>(
        &'a self,
        event: &'a Event,
    ) -> Pin<Box<dyn Future<Output = Result<(), TransportError>> + Send + 'a>> {
        Box::pin(async move {
            if self.closed.load(Ordering::Acquire) {
                return Err(TransportError::Closed);
            }
            let payload = self.encode(event);
            self.socket.send(&payload).await?;
            Ok(())
        })
    }

    fn close<'a>(&'a self) -> Pin<Box<dyn Future<Output = Result<(), TransportError>> + Send + 'a>> {
        Box::pin(async move {
            if self.closed.swap(true, Ordering::AcqRel) {
                return Err(TransportError::Closed);
            }
            debug!("StatsD UDP transport closed");
            Ok(())
        })
    }
}
