//! Driver configuration
//!
//! Every field has a default matching the MSM board files, so an empty
//! `[driver]` table in a board description is valid.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Default time a client gets to release the GPU before it is killed
pub const DEFAULT_REVOKE_TIMEOUT_MS: u64 = 2000;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Hw3dConfig {
    /// Revoke deadline in milliseconds
    pub revoke_timeout_ms: u64,

    /// Graphics core clock
    pub grp_clock: String,

    /// Internal memory clock
    pub imem_clock: String,

    /// Privileged endpoint name
    pub master_node: String,

    /// Arbitrated endpoint name
    pub client_node: String,

    /// Name the interrupt line is claimed under
    pub irq_name: String,
}

impl Default for Hw3dConfig {
    fn default() -> Self {
        Self {
            revoke_timeout_ms: DEFAULT_REVOKE_TIMEOUT_MS,
            grp_clock: "grp_clk".into(),
            imem_clock: "imem_clk".into(),
            master_node: "msm_hw3dm".into(),
            client_node: "msm_hw3dc".into(),
            irq_name: "hw3d".into(),
        }
    }
}

impl Hw3dConfig {
    pub fn revoke_timeout(&self) -> Duration {
        Duration::from_millis(self.revoke_timeout_ms)
    }

    pub fn with_revoke_timeout(mut self, timeout: Duration) -> Self {
        self.revoke_timeout_ms = timeout.as_millis() as u64;
        self
    }
}
