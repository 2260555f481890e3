//! Provisioner configuration loaded from `provisioner.toml`.
//!
//! [`ProvisionerConfig`] holds every tunable: the template catalog, the mock
//! address space, the workflow step sequence and delay, status labels and
//! the slot pool seed. Fields missing from the file fall back to defaults.
//! `PROVISIONER_STEP_DELAY_MS` takes precedence over the file for the delay.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::error::{ProvisionError, Result};
use crate::pool::{ResourceSlot, SlotId};
use crate::state_machine::RequestStatus;

pub const DEFAULT_CONFIG_FILE: &str = "provisioner.toml";
pub const STEP_DELAY_ENV: &str = "PROVISIONER_STEP_DELAY_MS";

/// Top-level configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ProvisionerConfig {
    #[serde(default)]
    pub templates: TemplateCatalog,

    #[serde(default)]
    pub mock: MockConfig,

    #[serde(default)]
    pub workflow: WorkflowConfig,

    #[serde(default)]
    pub status_labels: StatusLabels,

    #[serde(default)]
    pub pool: PoolConfig,

    /// Where the CLI keeps its JSON state between invocations.
    #[serde(default = "default_state_file")]
    pub state_file: String,
}

fn default_state_file() -> String {
    "provisioner-state.json".to_string()
}

impl Default for ProvisionerConfig {
    fn default() -> Self {
        Self {
            templates: TemplateCatalog::default(),
            mock: MockConfig::default(),
            workflow: WorkflowConfig::default(),
            status_labels: StatusLabels::default(),
            pool: PoolConfig::default(),
            state_file: default_state_file(),
        }
    }
}

impl ProvisionerConfig {
    /// Load `provisioner.toml` from the working directory, or defaults when absent.
    pub fn load() -> Result<Self> {
        Self::load_from(Path::new(DEFAULT_CONFIG_FILE))
    }

    /// Load from `path`; a missing file yields the defaults.
    pub fn load_from(path: &Path) -> Result<Self> {
        let mut config = if path.exists() {
            let contents = std::fs::read_to_string(path)?;
            toml::from_str::<ProvisionerConfig>(&contents)?
        } else {
            Self::default()
        };

        if let Ok(raw) = std::env::var(STEP_DELAY_ENV)
            && !raw.is_empty()
        {
            config.workflow.step_delay_ms = raw.parse().map_err(|_| {
                ProvisionError::Config(format!("{STEP_DELAY_ENV} must be an integer, got {raw:?}"))
            })?;
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.workflow.steps.is_empty() {
            return Err(ProvisionError::Config(
                "workflow.steps must name at least one step".into(),
            ));
        }
        if let Some((name, _)) = self.templates.0.iter().find(|(_, count)| **count == 0) {
            return Err(ProvisionError::Config(format!(
                "template {name:?} must require at least one slot"
            )));
        }
        Ok(())
    }
}

/// Template identifier → required slot count.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(transparent)]
pub struct TemplateCatalog(pub BTreeMap<String, usize>);

impl Default for TemplateCatalog {
    fn default() -> Self {
        let map = [("single", 1), ("standard", 3), ("enterprise", 5), ("k8s_small", 3)]
            .into_iter()
            .map(|(name, count)| (name.to_string(), count))
            .collect();
        Self(map)
    }
}

impl TemplateCatalog {
    /// Slots needed by `template`; unknown templates need one.
    pub fn slot_count(&self, template: &str) -> usize {
        self.0.get(template).copied().unwrap_or(1)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, usize)> {
        self.0.iter().map(|(name, count)| (name.as_str(), *count))
    }
}

/// Naming and address space used by the mock backend.
#[derive(Debug, Clone, Deserialize)]
pub struct MockConfig {
    /// First two octets of every synthesized address.
    #[serde(default = "default_address_base")]
    pub address_base: String,

    /// Third octet; the host octet is random.
    #[serde(default = "default_address_second")]
    pub address_second: String,

    /// Must contain `{slug}`.
    #[serde(default = "default_web_url_template")]
    pub web_url_template: String,

    /// Appended to `db-{slug}` to form the database VIP.
    #[serde(default = "default_db_vip_suffix")]
    pub db_vip_suffix: String,

    /// Port of every access target.
    #[serde(default = "default_ssh_port")]
    pub ssh_port: u16,

    /// Login user of every access target.
    #[serde(default = "default_ssh_user")]
    pub ssh_user: String,
}

fn default_address_base() -> String {
    "10.99".to_string()
}

fn default_address_second() -> String {
    "0".to_string()
}

fn default_web_url_template() -> String {
    "https://{slug}.mock.example.com".to_string()
}

fn default_db_vip_suffix() -> String {
    ".vip.mock.local".to_string()
}

fn default_ssh_port() -> u16 {
    22
}

fn default_ssh_user() -> String {
    "ubuntu".to_string()
}

impl Default for MockConfig {
    fn default() -> Self {
        Self {
            address_base: default_address_base(),
            address_second: default_address_second(),
            web_url_template: default_web_url_template(),
            db_vip_suffix: default_db_vip_suffix(),
            ssh_port: default_ssh_port(),
            ssh_user: default_ssh_user(),
        }
    }
}

/// Step messages and pacing of the provisioning workflow.
#[derive(Debug, Clone, Deserialize)]
pub struct WorkflowConfig {
    #[serde(default = "default_steps")]
    pub steps: Vec<String>,

    #[serde(default = "default_step_delay_ms")]
    pub step_delay_ms: u64,
}

fn default_steps() -> Vec<String> {
    [
        "Allocating IP...",
        "Creating Web tier...",
        "Creating DB tier...",
        "Configuring ALB...",
        "Registering SSH targets...",
        "Completed",
    ]
    .into_iter()
    .map(String::from)
    .collect()
}

fn default_step_delay_ms() -> u64 {
    800
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self {
            steps: default_steps(),
            step_delay_ms: default_step_delay_ms(),
        }
    }
}

impl WorkflowConfig {
    pub fn step_delay(&self) -> Duration {
        Duration::from_millis(self.step_delay_ms)
    }
}

/// Display labels for the four statuses.
#[derive(Debug, Clone, Deserialize)]
pub struct StatusLabels {
    #[serde(default = "default_pending_label")]
    pub pending: String,
    #[serde(default = "default_running_label")]
    pub running: String,
    #[serde(default = "default_completed_label")]
    pub completed: String,
    #[serde(default = "default_failed_label")]
    pub failed: String,
}

fn default_pending_label() -> String {
    RequestStatus::Pending.to_string()
}

fn default_running_label() -> String {
    RequestStatus::Running.to_string()
}

fn default_completed_label() -> String {
    RequestStatus::Completed.to_string()
}

fn default_failed_label() -> String {
    RequestStatus::Failed.to_string()
}

impl Default for StatusLabels {
    fn default() -> Self {
        Self {
            pending: default_pending_label(),
            running: default_running_label(),
            completed: default_completed_label(),
            failed: default_failed_label(),
        }
    }
}

impl StatusLabels {
    pub fn label(&self, status: RequestStatus) -> &str {
        match status {
            RequestStatus::Pending => &self.pending,
            RequestStatus::Running => &self.running,
            RequestStatus::Completed => &self.completed,
            RequestStatus::Failed => &self.failed,
        }
    }
}

/// Seed for the slot pool, generating `size` consecutive slots.
#[derive(Debug, Clone, Deserialize)]
pub struct PoolConfig {
    /// Number of slots seeded into an empty pool.
    #[serde(default = "default_pool_size")]
    pub size: u32,

    /// Slot names are this prefix followed by the host octet.
    #[serde(default = "default_name_prefix")]
    pub name_prefix: String,

    /// First three octets; the host octet starts at `first_host`.
    #[serde(default = "default_address_prefix")]
    pub address_prefix: String,

    /// Host octet, and slot id, of the first seeded slot.
    #[serde(default = "default_first_host")]
    pub first_host: u32,

    /// Tag written on every slot claimed through this process.
    #[serde(default = "default_owner_tag")]
    pub owner_tag: String,
}

fn default_pool_size() -> u32 {
    5
}

fn default_name_prefix() -> String {
    "WKLD-".to_string()
}

fn default_address_prefix() -> String {
    "192.168.40".to_string()
}

fn default_first_host() -> u32 {
    20
}

fn default_owner_tag() -> String {
    "admin".to_string()
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            size: default_pool_size(),
            name_prefix: default_name_prefix(),
            address_prefix: default_address_prefix(),
            first_host: default_first_host(),
            owner_tag: default_owner_tag(),
        }
    }
}

impl PoolConfig {
    /// Free slots numbered from `first_host`, e.g. `WKLD-20` at `192.168.40.20`.
    pub fn seed_slots(&self) -> Vec<ResourceSlot> {
        (0..self.size)
            .map(|offset| {
                let host = self.first_host + offset;
                ResourceSlot::free(
                    SlotId(host),
                    format!("{}{host}", self.name_prefix),
                    format!("{}.{host}", self.address_prefix),
                )
            })
            .collect()
    }
}
