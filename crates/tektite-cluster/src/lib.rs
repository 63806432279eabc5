//! # tektite-cluster: Consensus module for `Tektite`
//!
//! The per-member consensus agent of a replicated state-machine cluster
//! built on a reliable ordered log-streaming transport and a recording
//! archive. The agent replicates a totally-ordered log of client requests,
//! elects a leader, commits entries on quorum, delivers the committed
//! stream to co-located services, and coordinates snapshotting, recovery,
//! dynamic membership, and graceful termination.
//!
//! The agent is single-threaded and cooperative: a conductor calls
//! [`ConsensusAgent::do_work`] and backs off on zero work. All external
//! inputs arrive through transport subscriptions polled within the tick.
//!
//! # Key Types
//!
//! - [`ConsensusAgent`]: the agent itself
//! - [`ClusterConfig`]: recognised options
//! - [`ClusterCounters`]: shared counters observers read without locking
//! - [`AgentRunner`]: a duty-cycle loop for embedders

pub mod agent;
pub mod conductor;
pub mod config;
pub mod counters;
mod dynamic_join;
mod election;
pub mod error;
pub mod ingress;
pub mod log_stream;
pub mod members;
pub mod pending_ring;
pub mod recording_log;
pub mod service_proxy;
pub mod sessions;
mod snapshot;
pub mod timers;

#[cfg(test)]
mod tests;

pub use agent::{ConsensusAgent, ModuleState, Role};
pub use conductor::{AgentRunner, IdleStrategy};
pub use config::{ChannelConfig, ClusterConfig, TimeoutConfig};
pub use counters::ClusterCounters;
pub use error::{ClusterError, ClusterResult};
pub use members::{ClusterMember, MemberEndpoints, MemberRegistry};
pub use recording_log::{RecordingLog, RecoveryPlan};
pub use sessions::{AllowAllAuthenticator, Authenticator, SessionProxy, SessionState};
pub use snapshot::ModuleSnapshot;
