//! Configuration for a cluster member.
//!
//! Every recognised option has a default so a `ClusterConfig` can be built
//! from an empty TOML document. Timeouts are configured in nanoseconds, as
//! the option names say, and exposed as milliseconds to the tick loop.

use serde::{Deserialize, Serialize};

/// Default bound on messages processed or emitted per subsystem per tick.
pub const DEFAULT_MESSAGE_LIMIT: usize = 10;

/// Configuration of one cluster member.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    /// This member's id within `cluster_members`.
    pub cluster_member_id: u32,

    /// Leader to defer to during startup elections, if any.
    pub appointed_leader_id: Option<u32>,

    /// Static membership in cluster-member string format
    /// (`id,client,member,log,transfer,archive|…`). Empty for a dynamic
    /// joiner.
    pub cluster_members: String,

    /// Member-status endpoints to contact when dynamically joining.
    pub cluster_members_status_endpoints: Vec<String>,

    /// Dynamic joiner: skip snapshot retrieval and start from nothing.
    pub cluster_members_ignore_snapshot: bool,

    /// This member's own endpoints (`client,member,log,transfer,archive`),
    /// advertised when dynamically joining. Ignored for static members,
    /// whose endpoints come from `cluster_members`.
    pub member_endpoints: String,

    /// Number of hosted services executing the committed stream.
    pub service_count: usize,

    /// Bound on open plus pending client sessions.
    pub max_concurrent_sessions: usize,

    /// Bound on messages processed per subsystem per tick.
    pub message_limit: usize,

    /// Initial capacity of the pending service-message ring.
    pub pending_message_capacity: usize,

    pub timeouts: TimeoutConfig,
    pub channels: ChannelConfig,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            cluster_member_id: 0,
            appointed_leader_id: None,
            cluster_members: String::new(),
            cluster_members_status_endpoints: Vec::new(),
            cluster_members_ignore_snapshot: false,
            member_endpoints: String::new(),
            service_count: 1,
            max_concurrent_sessions: 250,
            message_limit: DEFAULT_MESSAGE_LIMIT,
            pending_message_capacity: 256,
            timeouts: TimeoutConfig::default(),
            channels: ChannelConfig::default(),
        }
    }
}

impl ClusterConfig {
    /// Parses a configuration from a TOML document.
    pub fn from_toml_str(text: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(text)
    }

    /// True when this member bootstraps by dynamic join rather than static
    /// membership.
    pub fn is_dynamic_join(&self) -> bool {
        self.cluster_members.is_empty() && !self.cluster_members_status_endpoints.is_empty()
    }
}

// ============================================================================
// Timeouts
// ============================================================================

/// Timeout and interval settings, in nanoseconds.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    pub session_timeout_ns: u64,
    pub leader_heartbeat_interval_ns: u64,
    pub leader_heartbeat_timeout_ns: u64,
    pub service_heartbeat_timeout_ns: u64,
    pub election_timeout_ns: u64,
    pub termination_timeout_ns: u64,
    /// Budget for startup recovery (snapshot load and service-ack barrier).
    pub recovery_timeout_ns: u64,
    /// Budget for the whole dynamic-join protocol.
    pub dynamic_join_timeout_ns: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            session_timeout_ns: 10_000_000_000,
            leader_heartbeat_interval_ns: 200_000_000,
            leader_heartbeat_timeout_ns: 10_000_000_000,
            service_heartbeat_timeout_ns: 10_000_000_000,
            election_timeout_ns: 1_000_000_000,
            termination_timeout_ns: 10_000_000_000,
            recovery_timeout_ns: 30_000_000_000,
            dynamic_join_timeout_ns: 30_000_000_000,
        }
    }
}

impl TimeoutConfig {
    pub fn session_timeout_ms(&self) -> i64 {
        ns_to_ms(self.session_timeout_ns)
    }

    pub fn leader_heartbeat_interval_ms(&self) -> i64 {
        ns_to_ms(self.leader_heartbeat_interval_ns)
    }

    pub fn leader_heartbeat_timeout_ms(&self) -> i64 {
        ns_to_ms(self.leader_heartbeat_timeout_ns)
    }

    pub fn service_heartbeat_timeout_ms(&self) -> i64 {
        ns_to_ms(self.service_heartbeat_timeout_ns)
    }

    pub fn election_timeout_ms(&self) -> i64 {
        ns_to_ms(self.election_timeout_ns)
    }

    pub fn termination_timeout_ms(&self) -> i64 {
        ns_to_ms(self.termination_timeout_ns)
    }

    pub fn recovery_timeout_ms(&self) -> i64 {
        ns_to_ms(self.recovery_timeout_ns)
    }

    pub fn dynamic_join_timeout_ms(&self) -> i64 {
        ns_to_ms(self.dynamic_join_timeout_ns)
    }
}

fn ns_to_ms(ns: u64) -> i64 {
    (ns / 1_000_000) as i64
}

// ============================================================================
// Channels
// ============================================================================

/// Channel and stream-id settings.
///
/// Member endpoints come from the cluster-member string; these settings name
/// the shared log channel, the media for endpoint channels, and the stream
/// ids of each flow.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelConfig {
    /// The replicated log channel shared by the cluster.
    pub log_channel: String,

    /// Media part used when building endpoint channels (`tek:<media>?…`).
    pub media: String,

    /// Control channel to this member's hosted service container.
    ///
    /// Empty selects the conventional `<media>?endpoint=node<id>-service`.
    pub service_control_channel: String,

    pub log_stream_id: i32,
    pub ingress_stream_id: i32,
    pub member_status_stream_id: i32,
    pub service_stream_id: i32,
    pub snapshot_stream_id: i32,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            log_channel: "tek:mem?endpoint=cluster-log".to_string(),
            media: "mem".to_string(),
            service_control_channel: String::new(),
            log_stream_id: 100,
            ingress_stream_id: 101,
            member_status_stream_id: 102,
            service_stream_id: 104,
            snapshot_stream_id: 106,
        }
    }
}

impl ChannelConfig {
    /// Channel for a named endpoint.
    pub fn endpoint_channel(&self, endpoint: &str) -> String {
        format!("tek:{}?endpoint={}", self.media, endpoint)
    }

    /// The service control channel for a member id.
    pub fn service_channel(&self, member_id: u32) -> String {
        if self.service_control_channel.is_empty() {
            format!("tek:{}?endpoint=node{}-service", self.media, member_id)
        } else {
            self.service_control_channel.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_from_empty_toml() {
        let config = ClusterConfig::from_toml_str("").expect("parse");
        assert_eq!(config.cluster_member_id, 0);
        assert_eq!(config.service_count, 1);
        assert_eq!(config.timeouts.session_timeout_ms(), 10_000);
        assert!(!config.is_dynamic_join());
    }

    #[test]
    fn overrides_from_toml() {
        let config = ClusterConfig::from_toml_str(
            r#"
            cluster_member_id = 2
            cluster_members = "0,a,b,c,d,e"
            appointed_leader_id = 0

            [timeouts]
            session_timeout_ns = 5000000000

            [channels]
            log_stream_id = 999
            "#,
        )
        .expect("parse");
        assert_eq!(config.cluster_member_id, 2);
        assert_eq!(config.appointed_leader_id, Some(0));
        assert_eq!(config.timeouts.session_timeout_ms(), 5_000);
        assert_eq!(config.channels.log_stream_id, 999);
        // Unset sections keep their defaults.
        assert_eq!(config.channels.ingress_stream_id, 101);
    }

    #[test]
    fn dynamic_join_detection() {
        let config = ClusterConfig {
            cluster_members: String::new(),
            cluster_members_status_endpoints: vec!["node0-status".into()],
            ..ClusterConfig::default()
        };
        assert!(config.is_dynamic_join());
    }
}
