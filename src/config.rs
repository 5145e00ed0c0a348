use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use facet::Facet;

use crate::credentials;
use crate::error::LabError;

pub const MIN_PASSWORD_LENGTH: usize = 8;

#[derive(Debug, Clone, Default, Facet)]
pub struct Config {
    #[facet(default)]
    pub calendar: CalendarConfig,
    #[facet(default)]
    pub inventory: InventoryConfig,
    #[facet(default)]
    pub password: PasswordConfig,
    #[facet(default)]
    pub wireguard: WireGuardConfig,
    #[facet(default)]
    pub email: EmailConfig,
}

#[derive(Debug, Clone, Default, Facet)]
#[facet(default)]
pub struct CalendarConfig {
    #[facet(default)]
    pub calendar_id: String,
    #[facet(default)]
    pub service_account_path: String,
}

#[derive(Debug, Clone, Facet)]
#[facet(default)]
pub struct InventoryConfig {
    #[facet(default = "qemu:///system")]
    pub libvirt_uri: String,
    /// Snapshot to revert to; the newest one when unset.
    pub snapshot_name: Option<String>,
    #[facet(default = 120)]
    pub agent_timeout_s: u64,
    /// user → machines that user may be given, first one preferred.
    #[facet(default)]
    pub user_machines: BTreeMap<String, Vec<String>>,
}

impl Default for InventoryConfig {
    fn default() -> Self {
        Self {
            libvirt_uri: "qemu:///system".into(),
            snapshot_name: None,
            agent_timeout_s: 120,
            user_machines: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, Facet)]
#[facet(default)]
pub struct PasswordConfig {
    #[facet(default = 16)]
    pub length: usize,
}

impl Default for PasswordConfig {
    fn default() -> Self {
        Self {
            length: credentials::DEFAULT_PASSWORD_LENGTH,
        }
    }
}

#[derive(Debug, Clone, Default, Facet)]
#[facet(default)]
pub struct WireGuardConfig {
    #[facet(default)]
    pub enabled: bool,
    #[facet(default)]
    pub server_public_key: String,
    #[facet(default)]
    pub server_endpoint: String,
    #[facet(default)]
    pub allowed_ips: Vec<String>,
    #[facet(default)]
    pub mtu: u32,
    #[facet(default)]
    pub keepalive: u32,
    /// Tunnel address handed to the n-th user of a run.
    #[facet(default)]
    pub client_addresses: Vec<String>,
    #[facet(default)]
    pub auto_register_peers: bool,
    #[facet(default)]
    pub opnsense_url: String,
    #[facet(default)]
    pub opnsense_insecure: bool,
}

impl WireGuardConfig {
    /// Checks only apply when the tunnel is enabled.
    pub fn validate(&self) -> Result<(), LabError> {
        if !self.enabled {
            return Ok(());
        }
        if self.server_public_key.is_empty() {
            return Err(LabError::Validation {
                message: "wireguard.server_public_key is required".into(),
            });
        }
        if self.server_endpoint.is_empty() {
            return Err(LabError::Validation {
                message: "wireguard.server_endpoint is required".into(),
            });
        }
        if self.client_addresses.is_empty() {
            return Err(LabError::Validation {
                message: "wireguard.client_addresses cannot be empty".into(),
            });
        }
        if !credentials::is_valid_key(&self.server_public_key) {
            return Err(LabError::Validation {
                message: "invalid wireguard.server_public_key format (must be 32-byte base64)"
                    .into(),
            });
        }
        if self.auto_register_peers && self.opnsense_url.is_empty() {
            return Err(LabError::Validation {
                message: "wireguard.opnsense_url is required when auto_register_peers is set"
                    .into(),
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Facet)]
#[facet(default)]
pub struct EmailConfig {
    #[facet(default)]
    pub smtp_host: String,
    #[facet(default = 587)]
    pub smtp_port: u16,
    #[facet(default)]
    pub username: String,
    #[facet(default)]
    pub from: String,
    /// When set, every message goes here instead of the booking's contact.
    #[facet(default)]
    pub test_recipient: String,
}

impl Default for EmailConfig {
    fn default() -> Self {
        Self {
            smtp_host: String::new(),
            smtp_port: 587,
            username: String::new(),
            from: String::new(),
            test_recipient: String::new(),
        }
    }
}

impl EmailConfig {
    pub fn is_configured(&self) -> bool {
        !self.smtp_host.is_empty()
    }
}

// ── secrets ───────────────────────────────────────────────

/// Credentials that never live in the config file.
#[derive(Clone, Default)]
pub struct Secrets {
    pub opnsense_api_key: Option<String>,
    pub opnsense_api_secret: Option<String>,
    pub smtp_password: Option<String>,
    /// Overrides `calendar.service_account_path`.
    pub service_account_path: Option<PathBuf>,
}

impl std::fmt::Debug for Secrets {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let set = |v: &Option<String>| if v.is_some() { "<set>" } else { "<unset>" };
        f.debug_struct("Secrets")
            .field("opnsense_api_key", &set(&self.opnsense_api_key))
            .field("opnsense_api_secret", &set(&self.opnsense_api_secret))
            .field("smtp_password", &set(&self.smtp_password))
            .field("service_account_path", &self.service_account_path)
            .finish()
    }
}

impl Config {
    pub fn service_account_path(&self, secrets: &Secrets) -> Option<PathBuf> {
        secrets.service_account_path.clone().or_else(|| {
            let p = &self.calendar.service_account_path;
            (!p.is_empty()).then(|| PathBuf::from(p))
        })
    }

    pub fn snapshot_name(&self) -> Option<&str> {
        self.inventory.snapshot_name.as_deref().filter(|s| !s.is_empty())
    }
}

// ── validation ────────────────────────────────────────────

fn validate_config(config: &Config) -> Result<(), LabError> {
    if config.password.length < MIN_PASSWORD_LENGTH {
        return Err(LabError::Validation {
            message: format!(
                "password.length must be at least {MIN_PASSWORD_LENGTH} (got {})",
                config.password.length
            ),
        });
    }

    if config.inventory.libvirt_uri.is_empty() {
        return Err(LabError::Validation {
            message: "inventory.libvirt_uri cannot be empty".into(),
        });
    }

    for (user, machines) in &config.inventory.user_machines {
        if user.trim().is_empty() {
            return Err(LabError::Validation {
                message: "inventory.user_machines has an empty user name".into(),
            });
        }
        if machines.iter().any(|m| m.trim().is_empty()) {
            return Err(LabError::Validation {
                message: format!("inventory.user_machines.{user} has an empty machine name"),
            });
        }
    }

    config.wireguard.validate()?;

    if config.email.is_configured() && config.email.from.is_empty() {
        return Err(LabError::Validation {
            message: "email.from is required when email.smtp_host is set".into(),
        });
    }

    Ok(())
}

// ── public API ────────────────────────────────────────────

pub fn parse_config(contents: &str, path: &Path) -> Result<Config, LabError> {
    let config: Config = facet_toml::from_str(contents).map_err(|e| LabError::ConfigParse {
        path: path.display().to_string(),
        message: e.to_string(),
    })?;
    validate_config(&config)?;
    Ok(config)
}

pub fn load_config(path: &Path) -> Result<Config, LabError> {
    let contents = std::fs::read_to_string(path).map_err(|source| LabError::ConfigLoad {
        path: path.display().to_string(),
        source,
    })?;
    parse_config(&contents, path)
}
