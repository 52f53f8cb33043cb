use serde::Deserialize;
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use crate::admission::DEFAULT_MAX_QUEUE_SIZE;
use crate::capability::PermissionGrant;
use crate::execution::{ExecutionOptions, RuntimeMode, SnapRecord, StaticSnaps};
use crate::rpc::engine::DEFAULT_COMMAND_TIMEOUT;
use crate::snap::SnapId;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    #[serde(default)]
    pub service: ServiceConfig,
    pub runtime: RuntimeConfig,
    #[serde(default)]
    pub state: StateConfig,
    #[serde(default)]
    pub entropy: EntropyConfig,
    #[serde(default)]
    pub snaps: Vec<SnapConfig>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServiceConfig {
    /// Concurrent requests allowed per origin
    #[serde(default = "default_max_queue_size")]
    pub max_queue_size: usize,
    #[serde(default = "default_command_timeout_ms")]
    pub command_timeout_ms: u64,
    #[serde(default = "default_init_timeout_ms")]
    pub init_timeout_ms: u64,
    #[serde(default = "default_max_request_time_ms")]
    pub max_request_time_ms: u64,
    #[serde(default = "default_termination_timeout_ms")]
    pub termination_timeout_ms: u64,
    #[serde(default)]
    pub runtime_mode: RuntimeMode,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            max_queue_size: default_max_queue_size(),
            command_timeout_ms: default_command_timeout_ms(),
            init_timeout_ms: default_init_timeout_ms(),
            max_request_time_ms: default_max_request_time_ms(),
            termination_timeout_ms: default_termination_timeout_ms(),
            runtime_mode: RuntimeMode::default(),
        }
    }
}

/// The sandbox process spawned for each job.
#[derive(Debug, Deserialize, Clone)]
pub struct RuntimeConfig {
    pub program: PathBuf,
    #[serde(default)]
    pub args: Vec<String>,
    /// Only these variables reach the sandbox; the rest of the host
    /// environment is cleared. Supports ${ENV_VAR} substitution
    #[serde(default)]
    pub env: HashMap<String, String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StateConfig {
    #[serde(default = "default_state_path")]
    pub path: PathBuf,
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            path: default_state_path(),
        }
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct EntropyConfig {
    /// Hex-encoded secret seed. Random per process when unset, so derived
    /// values are not stable across restarts. Supports ${ENV_VAR} substitution
    pub seed: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct SnapConfig {
    pub id: SnapId,
    /// Key the sandbox uses to load the snap
    pub source: String,
    /// Origins allowed to call the snap ("*" for any)
    #[serde(default)]
    pub allowed_origins: Vec<String>,
    #[serde(default)]
    pub permissions: PermissionGrant,
}

fn default_max_queue_size() -> usize {
    DEFAULT_MAX_QUEUE_SIZE
}

fn default_command_timeout_ms() -> u64 {
    DEFAULT_COMMAND_TIMEOUT.as_millis() as u64
}

fn default_init_timeout_ms() -> u64 {
    60_000
}

fn default_max_request_time_ms() -> u64 {
    60_000
}

fn default_termination_timeout_ms() -> u64 {
    1_000
}

fn default_state_path() -> PathBuf {
    PathBuf::from("./data/state")
}

impl ServiceConfig {
    pub fn options(&self) -> ExecutionOptions {
        ExecutionOptions {
            max_queue_size: self.max_queue_size,
            command_timeout: Duration::from_millis(self.command_timeout_ms),
            init_timeout: Duration::from_millis(self.init_timeout_ms),
            max_request_time: Duration::from_millis(self.max_request_time_ms),
            termination_timeout: Duration::from_millis(self.termination_timeout_ms),
            runtime_mode: self.runtime_mode,
        }
    }
}

impl EntropyConfig {
    /// Decoded seed, if one is configured
    pub fn seed_bytes(&self) -> anyhow::Result<Option<Vec<u8>>> {
        match &self.seed {
            None => Ok(None),
            Some(seed) => {
                let bytes = hex::decode(seed.trim_start_matches("0x"))
                    .map_err(|e| anyhow::anyhow!("entropy seed is not valid hex: {e}"))?;
                if bytes.len() < 16 {
                    anyhow::bail!("entropy seed must be at least 16 bytes");
                }
                Ok(Some(bytes))
            }
        }
    }
}

impl Config {
    pub fn load(path: &str) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        // Expand environment variables like ${SNAP_ENTROPY_SEED}
        let expanded = shellexpand::env(&content)?;
        Self::parse(&expanded)
    }

    pub fn parse(content: &str) -> anyhow::Result<Self> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> anyhow::Result<()> {
        if self.service.max_queue_size == 0 {
            anyhow::bail!("service.max_queue_size must be at least 1");
        }
        let mut seen = std::collections::HashSet::new();
        for snap in &self.snaps {
            if !seen.insert(&snap.id) {
                anyhow::bail!("snap '{}' is declared twice", snap.id);
            }
        }
        Ok(())
    }

    /// Registry of the declared snaps
    pub fn snaps(&self) -> StaticSnaps {
        let registry = StaticSnaps::new();
        for snap in &self.snaps {
            registry.insert(
                snap.id.clone(),
                SnapRecord {
                    source: snap.source.clone(),
                    allowed_origins: snap.allowed_origins.clone(),
                    grant: snap.permissions.clone(),
                },
            );
        }
        registry
    }
}
