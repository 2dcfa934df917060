// ── Runtime subscription configuration ──
//
// These types describe *which* server to reach and *how* a subscription and
// its notification queue behave. They never touch disk: `opcae-config` (or
// any caller) builds them and hands them in.

use std::time::Duration;

use opcae_api::Guid;
use serde::{Deserialize, Serialize};

/// What the sink does with a batch when the notification queue is full.
///
/// The sink runs on the server's delivery thread, so none of these block
/// without bound.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
#[serde(tag = "policy", rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum Backpressure {
    /// Wait up to `timeout` for room, then drop the incoming batch.
    Wait {
        #[serde(with = "duration_ms")]
        timeout: Duration,
    },
    /// Evict the oldest queued batch to make room.
    DropOldest,
    /// Discard the incoming batch.
    DropNewest,
}

impl Default for Backpressure {
    fn default() -> Self {
        Self::Wait {
            timeout: Duration::from_secs(1),
        }
    }
}

/// Parameters for one event subscription.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionConfig {
    /// Whether the server should start sending notifications immediately.
    pub active: bool,
    /// Requested buffer time in milliseconds; 0 asks for immediate delivery.
    /// The server may revise it.
    pub buffer_time_ms: u32,
    /// Requested maximum events per callback; 0 means no limit.
    pub max_size: u32,
    /// Batches the notification queue holds before backpressure applies.
    pub queue_capacity: usize,
    pub backpressure: Backpressure,
}

impl Default for SubscriptionConfig {
    fn default() -> Self {
        Self {
            active: true,
            buffer_time_ms: 1000,
            max_size: 0,
            queue_capacity: 256,
            backpressure: Backpressure::default(),
        }
    }
}

/// How a server class is named to the activation service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServerId {
    Clsid(Guid),
    ProgId(String),
}

impl std::fmt::Display for ServerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Clsid(clsid) => write!(f, "{{{clsid}}}"),
            Self::ProgId(prog_id) => f.write_str(prog_id),
        }
    }
}

/// A server instance: its class and the node it runs on.
///
/// Consumed by an [`Activator`](crate::activation::Activator); the core does
/// not activate anything itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerTarget {
    pub server: ServerId,
    /// Host name or address. Empty means this machine.
    #[serde(default)]
    pub node: String,
}

impl ServerTarget {
    pub fn local(server: ServerId) -> Self {
        Self {
            server,
            node: String::new(),
        }
    }

    pub fn remote(server: ServerId, node: impl Into<String>) -> Self {
        Self {
            server,
            node: node.into(),
        }
    }

    /// Whether the node names this machine, so in-process or local-server
    /// activation applies instead of a remote one.
    pub fn is_local(&self) -> bool {
        let node = self.node.trim();
        node.is_empty()
            || node == "."
            || node.eq_ignore_ascii_case("localhost")
            || node == "127.0.0.1"
            || node == "::1"
    }
}

impl std::fmt::Display for ServerTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_local() {
            write!(f, "{}", self.server)
        } else {
            write!(f, "{} on {}", self.server, self.node)
        }
    }
}

mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(value.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn local_nodes() {
        let id = ServerId::ProgId("Vendor.AE.1".into());
        for node in ["", ".", "localhost", "LOCALHOST", "127.0.0.1", "::1", "  "] {
            assert!(ServerTarget::remote(id.clone(), node).is_local(), "{node:?}");
        }
        for node in ["plant-scada", "10.0.0.5", "::2"] {
            assert!(!ServerTarget::remote(id.clone(), node).is_local(), "{node:?}");
        }
    }

    #[test]
    fn target_display_mentions_remote_node() {
        let id = ServerId::ProgId("Vendor.AE.1".into());
        assert_eq!(ServerTarget::local(id.clone()).to_string(), "Vendor.AE.1");
        assert_eq!(
            ServerTarget::remote(id, "scada01").to_string(),
            "Vendor.AE.1 on scada01"
        );
    }

    #[test]
    fn backpressure_serializes_with_its_timeout_in_ms() {
        let json = serde_json::to_value(Backpressure::default()).unwrap();
        assert_eq!(json, serde_json::json!({ "policy": "wait", "timeout": 1000 }));
        let parsed: Backpressure = serde_json::from_value(serde_json::json!({ "policy": "drop-oldest" })).unwrap();
        assert_eq!(parsed, Backpressure::DropOldest);
        assert_eq!(Backpressure::DropNewest.to_string(), "drop-newest");
    }
}
