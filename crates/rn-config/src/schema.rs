//! Session configuration schema.
//!
//! Every section and field has a default, so an empty document is a valid
//! configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SessionConfig {
    pub graph: GraphSettings,
    pub ctrl: CtrlSettings,
    pub epid: EpidSettings,
    pub stream: StreamSettings,
}

/// Property resolution and action delivery limits.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct GraphSettings {
    /// Full forward/backward sweeps over the graph before giving up.
    pub max_graph_sweeps: usize,
    /// Resolver rounds within a single node before giving up.
    pub max_node_rounds: usize,
    /// Actions delivered per dispatch before giving up.
    pub max_action_iterations: usize,
    /// Packet size in bytes used when a connection asks for size 0.
    pub default_pkt_size: usize,
}

impl Default for GraphSettings {
    fn default() -> Self {
        Self {
            max_graph_sweeps: 2,
            max_node_rounds: 32,
            max_action_iterations: 200,
            default_pkt_size: 8000,
        }
    }
}

/// Control-port endpoint defaults.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CtrlSettings {
    pub timeout_s: f64,
    /// Used for operations known to take long (e.g. timed commands far out).
    pub massive_timeout_s: f64,
    /// Downstream buffer capacity in 32-bit words.
    pub buff_capacity_words: usize,
    pub max_outstanding_async_msgs: usize,
}

impl CtrlSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs_f64(self.timeout_s)
    }

    pub fn massive_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.massive_timeout_s)
    }
}

impl Default for CtrlSettings {
    fn default() -> Self {
        Self {
            timeout_s: 1.0,
            massive_timeout_s: 10.0,
            buff_capacity_words: 64,
            max_outstanding_async_msgs: 1,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EpidSettings {
    /// First endpoint ID handed out; 0 is reserved.
    pub start_epid: u16,
}

impl Default for EpidSettings {
    fn default() -> Self {
        Self { start_epid: 1 }
    }
}

/// Data stream flow-control cadence.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct StreamSettings {
    /// Receiver sends a flow-control status after this many bytes...
    pub fc_resp_freq_bytes: u64,
    /// ...or this many packets, whichever comes first (0 disables).
    pub fc_resp_freq_packets: u64,
    /// Back-off between space checks when the destination buffer is full.
    pub send_poll_us: u64,
}

impl StreamSettings {
    pub fn send_poll(&self) -> Duration {
        Duration::from_micros(self.send_poll_us)
    }
}

impl Default for StreamSettings {
    fn default() -> Self {
        Self {
            fc_resp_freq_bytes: 64 * 1024,
            fc_resp_freq_packets: 0,
            send_poll_us: 50,
        }
    }
}
