//! The conductor: drives the agent's duty cycle with an idle strategy.
//!
//! The agent never blocks; it reports how much work a tick did and the
//! conductor backs off when there is none. Embedders either run the loop
//! here or call [`crate::ConsensusAgent::do_work`] from their own duty
//! cycle, as the test harness does.

use std::time::{Duration, Instant};

use crate::agent::{ConsensusAgent, ModuleState};

// ============================================================================
// Idle Strategy
// ============================================================================

/// How the conductor behaves when a tick produced no work.
#[derive(Debug, Clone, Copy)]
pub enum IdleStrategy {
    /// Burn the core; lowest latency.
    BusySpin,
    /// Spin, then yield, then sleep up to `max_sleep`.
    Backoff { max_sleep: Duration },
}

impl Default for IdleStrategy {
    fn default() -> Self {
        IdleStrategy::Backoff {
            max_sleep: Duration::from_millis(1),
        }
    }
}

impl IdleStrategy {
    const SPIN_LIMIT: u32 = 10;
    const YIELD_LIMIT: u32 = 20;

    /// Idles according to the consecutive zero-work count.
    pub fn idle(&self, zero_work_ticks: u32) {
        match self {
            IdleStrategy::BusySpin => std::hint::spin_loop(),
            IdleStrategy::Backoff { max_sleep } => {
                if zero_work_ticks < Self::SPIN_LIMIT {
                    std::hint::spin_loop();
                } else if zero_work_ticks < Self::YIELD_LIMIT {
                    std::thread::yield_now();
                } else {
                    std::thread::sleep(*max_sleep);
                }
            }
        }
    }
}

// ============================================================================
// Agent Runner
// ============================================================================

/// Owns an agent and runs its duty cycle on the calling thread.
pub struct AgentRunner {
    agent: ConsensusAgent,
    idle: IdleStrategy,
    epoch: Instant,
}

impl AgentRunner {
    pub fn new(agent: ConsensusAgent, idle: IdleStrategy) -> Self {
        Self {
            agent,
            idle,
            epoch: Instant::now(),
        }
    }

    pub fn agent(&self) -> &ConsensusAgent {
        &self.agent
    }

    pub fn agent_mut(&mut self) -> &mut ConsensusAgent {
        &mut self.agent
    }

    /// Runs until the module closes.
    pub fn run(&mut self) {
        let mut zero_work_ticks = 0;
        while self.agent.state() != ModuleState::Closed {
            let now_ms = self.epoch.elapsed().as_millis() as i64;
            let work = self.agent.do_work(now_ms);
            if work == 0 {
                zero_work_ticks += 1;
                self.idle.idle(zero_work_ticks);
            } else {
                zero_work_ticks = 0;
            }
        }
    }
}
