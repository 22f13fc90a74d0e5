//! Configuration and health counters.
//!
//! This module holds:
//! - Engine configuration (queue sizes, message budget)
//! - Bridge daemon configuration
//! - Delivery counters and their snapshot type

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use crate::addr::MacAddr;
use crate::frame::ETHERMAX;

fn default_recv_hiwat() -> usize {
    8192
}

fn default_bridge_recv_hiwat() -> usize {
    20000
}

fn default_message_budget() -> usize {
    4 * 1024 * 1024
}

/// Configuration for the multiplexing engine
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Receive queue high-water mark of a newly opened channel, in bytes.
    ///
    /// Data for a channel whose queue is at or above this mark is skipped.
    #[serde(default = "default_recv_hiwat")]
    pub recv_hiwat: usize,

    /// Receive high-water mark applied when a channel registers as the
    /// bridging channel.
    #[serde(default = "default_bridge_recv_hiwat")]
    pub bridge_recv_hiwat: usize,

    /// Total bytes that may be queued toward consumers across all channels.
    ///
    /// A delivery that does not fit is dropped and counted as exhausted.
    #[serde(default = "default_message_budget")]
    pub message_budget: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            recv_hiwat: default_recv_hiwat(),
            bridge_recv_hiwat: default_bridge_recv_hiwat(),
            message_budget: default_message_budget(),
        }
    }
}

fn default_hub_port() -> u16 {
    80
}

fn default_sendbuf_threshold() -> usize {
    2 * ETHERMAX
}

/// Configuration for the bridging daemon
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BridgeConfig {
    /// Hub address
    pub hub_addr: String,
    /// Hub port
    #[serde(default = "default_hub_port")]
    pub hub_port: u16,
    /// Instance (PPA) the bridge attaches to
    #[serde(default)]
    pub instance: u32,
    /// Fixed hardware address for the instance; generated when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mac: Option<MacAddr>,

    /// Idle flush interval: buffered records are written out after this
    /// long without a flush.
    #[serde(with = "humantime_serde")]
    pub flush_interval: Duration,

    /// Flush as soon as more than this many bytes are buffered
    #[serde(default = "default_sendbuf_threshold")]
    pub sendbuf_threshold: usize,

    /// Health/logging interval
    #[serde(with = "humantime_serde")]
    pub health_interval: Duration,

    #[serde(default)]
    pub engine: EngineConfig,
}

impl BridgeConfig {
    /// `host:port` of the hub
    pub fn hub_endpoint(&self) -> String {
        format!("{}:{}", self.hub_addr, self.hub_port)
    }
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            hub_addr: "127.0.0.1".to_string(),
            hub_port: default_hub_port(),
            instance: 0,
            mac: None,
            flush_interval: Duration::from_millis(400),
            sendbuf_threshold: default_sendbuf_threshold(),
            health_interval: Duration::from_secs(5),
            engine: EngineConfig::default(),
        }
    }
}

/// Snapshot of the engine's delivery counters
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EngineStats {
    /// Copies handed to consumers by fan-out
    pub delivered: u64,
    /// Recipients skipped because their receive queue was full
    pub skipped_backpressure: u64,
    /// Recipients skipped because the message budget was exhausted
    pub skipped_exhausted: u64,
    /// Frames handed to a bridging channel
    pub bridge_forwarded: u64,
    /// Frames dropped on the way to the bridge (none registered, or full)
    pub bridge_dropped: u64,
    /// Frames shorter than a link header
    pub runt_dropped: u64,
    /// Acknowledgments dropped because the message budget was exhausted
    pub acks_dropped: u64,
    /// Channels found attached without an instance link
    pub invariant_violations: u64,
}

#[derive(Debug, Default)]
pub(crate) struct Counters {
    pub(crate) delivered: AtomicU64,
    pub(crate) skipped_backpressure: AtomicU64,
    pub(crate) skipped_exhausted: AtomicU64,
    pub(crate) bridge_forwarded: AtomicU64,
    pub(crate) bridge_dropped: AtomicU64,
    pub(crate) runt_dropped: AtomicU64,
    pub(crate) acks_dropped: AtomicU64,
    pub(crate) invariant_violations: AtomicU64,
}

impl Counters {
    pub(crate) fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self) -> EngineStats {
        let get = |c: &AtomicU64| c.load(Ordering::Relaxed);
        EngineStats {
            delivered: get(&self.delivered),
            skipped_backpressure: get(&self.skipped_backpressure),
            skipped_exhausted: get(&self.skipped_exhausted),
            bridge_forwarded: get(&self.bridge_forwarded),
            bridge_dropped: get(&self.bridge_dropped),
            runt_dropped: get(&self.runt_dropped),
            acks_dropped: get(&self.acks_dropped),
            invariant_violations: get(&self.invariant_violations),
        }
    }
}
