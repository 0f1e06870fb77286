//! Worker configuration: binary flags plus the typed JSON files in the
//! user-data directory (`relay-config.json`, `gateway-settings.json`).
//!
//! Invalid configuration is fatal at startup.

use std::path::{Path, PathBuf};

use clap::Parser;
use serde::{Deserialize, Serialize};

use hypertuna_sdk::error::Error;
use hypertuna_sdk::Result;

/// Default public gateway host.
pub const DEFAULT_PUBLIC_GATEWAY: &str = "hypertuna.com";

/// Command-line configuration of the relay worker.
#[derive(Parser, Debug, Clone)]
#[command(name = "hypertuna-relay", about = "Hypertuna relay worker")]
pub struct WorkerConfig {
    /// Address the local gateway listens on.
    #[arg(long, default_value = "127.0.0.1:4889")]
    pub gateway_addr: String,

    /// User-data directory (config files, auth exports, message db).
    #[arg(long, default_value = ".")]
    pub data_dir: String,

    /// Sqlite path for message history. Defaults to
    /// `<data_dir>/hypertuna.db`; `:memory:` disables persistence.
    #[arg(long)]
    pub db_path: Option<String>,

    /// Serve the worker control channel on stdin/stdout.
    #[arg(long, action = clap::ArgAction::Set, default_value_t = true)]
    pub control_channel: bool,

    /// Register served relays with the public gateway.
    #[arg(long)]
    pub public_register: bool,

    /// Public gateway host.
    #[arg(long, default_value = DEFAULT_PUBLIC_GATEWAY)]
    pub public_gateway: String,

    /// Shared secret for public-gateway registration.
    #[arg(long, env = "HYPERTUNA_GATEWAY_SECRET")]
    pub public_gateway_secret: Option<String>,

    /// Quiescence window before membership-change notifications (ms).
    #[arg(long, default_value_t = 300)]
    pub member_debounce_ms: u64,

    /// Maximum concurrent gateway connections per client IP.
    #[arg(long, default_value_t = 20)]
    pub max_conns_per_ip: u32,
}

impl WorkerConfig {
    pub fn db_path(&self) -> String {
        self.db_path
            .clone()
            .unwrap_or_else(|| format!("{}/hypertuna.db", self.data_dir))
    }

    pub fn relay_config_path(&self) -> PathBuf {
        Path::new(&self.data_dir).join("relay-config.json")
    }

    pub fn gateway_settings_path(&self) -> PathBuf {
        Path::new(&self.data_dir).join("gateway-settings.json")
    }

    pub fn auth_export_path(&self, relay_id: &str) -> PathBuf {
        Path::new(&self.data_dir).join(format!("{relay_id}-auth.json"))
    }
}

/// `relay-config.json`: the worker's identity and API endpoint. Field
/// names follow the control-channel `config` message.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RelayConfigFile {
    pub nostr_pubkey_hex: String,
    #[serde(default)]
    pub nostr_npub: String,
    pub nostr_nsec: String,
    #[serde(rename = "apiUrl", default)]
    pub api_url: String,
    /// Discovery relays to connect at startup.
    #[serde(default)]
    pub discovery_relays: Vec<String>,
}

impl RelayConfigFile {
    pub fn load(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path)
            .map_err(|e| Error::ConfigInvalid(format!("{}: {e}", path.display())))?;
        let config: Self = serde_json::from_str(&json)
            .map_err(|e| Error::ConfigInvalid(format!("{}: {e}", path.display())))?;
        config.validate()?;
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)
            .map_err(|e| Error::ConfigInvalid(format!("{}: {e}", path.display())))
    }

    pub fn validate(&self) -> Result<()> {
        if self.nostr_nsec.is_empty() && self.nostr_pubkey_hex.is_empty() {
            return Err(Error::ConfigInvalid(
                "relay-config.json needs nostr_nsec or nostr_pubkey_hex".into(),
            ));
        }
        if !self.nostr_pubkey_hex.is_empty()
            && (self.nostr_pubkey_hex.len() != 64
                || hex::decode(&self.nostr_pubkey_hex).is_err())
        {
            return Err(Error::ConfigInvalid("nostr_pubkey_hex is not 32-byte hex".into()));
        }
        Ok(())
    }
}

/// `gateway-settings.json`: the user's local gateway options.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewaySettings {
    #[serde(default = "default_gateway_host")]
    pub public_gateway_host: String,
    #[serde(default)]
    pub register_publicly: bool,
    /// Additional gateways advertised to peers.
    #[serde(default)]
    pub advertised_gateways: Vec<String>,
}

fn default_gateway_host() -> String {
    DEFAULT_PUBLIC_GATEWAY.to_string()
}

impl Default for GatewaySettings {
    fn default() -> Self {
        Self {
            public_gateway_host: default_gateway_host(),
            register_publicly: false,
            advertised_gateways: Vec::new(),
        }
    }
}

impl GatewaySettings {
    /// Load settings, falling back to defaults when the file is absent.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let json = std::fs::read_to_string(path)
            .map_err(|e| Error::ConfigInvalid(format!("{}: {e}", path.display())))?;
        serde_json::from_str(&json)
            .map_err(|e| Error::ConfigInvalid(format!("{}: {e}", path.display())))
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)
            .map_err(|e| Error::ConfigInvalid(format!("{}: {e}", path.display())))
    }
}

/// Camel-case a human relay name for use in relay URL paths
/// (`"My Relay Name"` → `"myRelayName"`).
pub fn camel_case_relay_name(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut upper_next = false;
    for ch in name.chars() {
        if ch.is_alphanumeric() {
            if out.is_empty() {
                out.extend(ch.to_lowercase());
            } else if upper_next {
                out.extend(ch.to_uppercase());
            } else {
                out.push(ch);
            }
            upper_next = false;
        } else {
            upper_next = true;
        }
    }
    out
}
