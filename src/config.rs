//! Configuration for the RA engine
//!
//! CLI arguments and environment variable handling using clap. The parsed
//! `Args` are validated once and frozen into a `ConfigSnapshot` before any
//! Session is created.

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use serde::Serialize;

use crate::diagnostics::LogLevel;
use crate::keys::{
    KeyStore, SymKey, DRM_TRANSPORT_KEY_NAME, MASTER_KEY_NAME, TRANSPORT_KEY_NAME,
};
use crate::types::{RaError, Result};

pub const DEFAULT_CARD_MANAGER_AID: &str = "A0000000030000";
pub const DEFAULT_NETKEY_INSTANCE_AID: &str = "627601FF000000";
pub const DEFAULT_NETKEY_FILE_AID: &str = "627601FF0000";
pub const DEFAULT_NETKEY_OLD_INSTANCE_AID: &str = "A00000000101";
pub const DEFAULT_NETKEY_OLD_FILE_AID: &str = "A000000001";
pub const DEFAULT_APPLET_SO_PIN: &str = "000000000000";

/// token-ra - registration-authority engine for smart-card tokens
#[derive(Parser, Debug, Clone)]
#[command(name = "token-ra")]
#[command(about = "Secure channel session keys and server-side key lifecycle for smart-card tokens")]
pub struct Args {
    /// Comma-separated TKS base URLs, in pool order
    #[arg(long, env = "TKS_URLS", default_value = "")]
    pub tks_urls: String,

    /// Comma-separated CA base URLs, in pool order
    #[arg(long, env = "CA_URLS", default_value = "")]
    pub ca_urls: String,

    /// Comma-separated DRM base URLs, in pool order
    #[arg(long, env = "DRM_URLS", default_value = "")]
    pub drm_urls: String,

    /// Backend request timeout in milliseconds
    /// Timeouts surface as connection failures and trigger failover
    #[arg(long, env = "REQUEST_TIMEOUT_MS", default_value = "30000")]
    pub request_timeout_ms: u64,

    /// Shared TKS transport key (hex, 32 bytes)
    #[arg(long, env = "TRANSPORT_KEY")]
    pub transport_key: Option<String>,

    /// DRM transport key (hex, 32 bytes); needed to wrap locally derived KEKs
    #[arg(long, env = "DRM_TRANSPORT_KEY")]
    pub drm_transport_key: Option<String>,

    /// Local master key (hex, 32 bytes)
    /// When set, session keys are diversified in-process instead of by the TKS
    #[arg(long, env = "MASTER_KEY")]
    pub master_key: Option<String>,

    /// Debug log threshold (4, 6, 8 or 9)
    #[arg(long, env = "DEBUG_LOG_LEVEL", default_value = "6")]
    pub debug_log_level: u8,

    /// Error log threshold (4, 6, 8 or 9)
    #[arg(long, env = "ERROR_LOG_LEVEL", default_value = "9")]
    pub error_log_level: u8,

    /// Buffered diagnostics file (optional)
    #[arg(long, env = "DEBUG_LOG_FILE")]
    pub debug_log_file: Option<PathBuf>,

    /// Diagnostics flush interval in milliseconds
    #[arg(long, env = "LOG_FLUSH_INTERVAL_MS", default_value = "5000")]
    pub log_flush_interval_ms: u64,

    /// Unflushed bytes that force an early flush
    #[arg(long, env = "LOG_BUFFER_SIZE", default_value = "65536")]
    pub log_buffer_size: usize,

    /// Applet configuration
    #[command(flatten)]
    pub applet: AppletArgs,

    /// Secure channel configuration
    #[command(flatten)]
    pub channel: ChannelArgs,

    /// Authentication plugin configuration
    #[command(flatten)]
    pub auth: AuthArgs,

    /// Publisher plugin library (optional)
    #[arg(long, env = "PUBLISHER_LIB")]
    pub publisher_lib: Option<String>,

    /// Publisher plugin factory (optional)
    #[arg(long, env = "PUBLISHER_FACTORY")]
    pub publisher_factory: Option<String>,

    /// Allowed token state transitions, "from:to,from:to"
    #[arg(long, env = "TOKENDB_ALLOWED_TRANSITIONS", default_value = "0:1,1:2,2:1,1:3,2:3,3:1")]
    pub tokendb_allowed_transitions: String,

    /// Allowed token state transitions for operations, "from:to,from:to"
    #[arg(long, env = "OPERATIONS_ALLOWED_TRANSITIONS", default_value = "0:1,1:2,2:1,1:3,2:3,3:1")]
    pub operations_allowed_transitions: String,
}

/// Applet identifiers and SO PIN
#[derive(Parser, Debug, Clone)]
pub struct AppletArgs {
    #[arg(long, env = "CARD_MANAGER_AID", default_value = DEFAULT_CARD_MANAGER_AID)]
    pub card_manager_aid: String,

    #[arg(long, env = "NETKEY_INSTANCE_AID", default_value = DEFAULT_NETKEY_INSTANCE_AID)]
    pub netkey_instance_aid: String,

    #[arg(long, env = "NETKEY_FILE_AID", default_value = DEFAULT_NETKEY_FILE_AID)]
    pub netkey_file_aid: String,

    #[arg(long, env = "NETKEY_OLD_INSTANCE_AID", default_value = DEFAULT_NETKEY_OLD_INSTANCE_AID)]
    pub netkey_old_instance_aid: String,

    #[arg(long, env = "NETKEY_OLD_FILE_AID", default_value = DEFAULT_NETKEY_OLD_FILE_AID)]
    pub netkey_old_file_aid: String,

    /// Default security-officer PIN set on new applets
    #[arg(long, env = "APPLET_SO_PIN", default_value = DEFAULT_APPLET_SO_PIN)]
    pub applet_so_pin: String,
}

/// Secure channel options
#[derive(Parser, Debug, Clone)]
pub struct ChannelArgs {
    /// Channel security level
    #[arg(long, env = "CHANNEL_SEC_LEVEL", default_value = "SECURE_MSG_MAC_ENC")]
    pub channel_sec_level: String,

    /// Encrypt channel traffic
    #[arg(long, env = "CHANNEL_ENCRYPTION", default_value = "true")]
    pub channel_encryption: bool,
}

/// Authentication plugin options
#[derive(Parser, Debug, Clone)]
pub struct AuthArgs {
    #[arg(long, env = "AUTHS_ENABLE", default_value = "true")]
    pub auths_enable: bool,

    /// Authentication plugin used when none is named
    #[arg(long, env = "AUTHS_CURRENT_IMPL", default_value = "ldap1")]
    pub auths_current_impl: String,

    /// Comma-separated authentication plugin instances
    #[arg(long, env = "AUTHS_PLUGINS", default_value = "ldap1")]
    pub auths_plugins: String,
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

fn parse_key(name: &str, value: Option<&str>) -> Result<Option<SymKey>> {
    value
        .map(|hex_str| {
            SymKey::from_hex(hex_str.trim())
                .map_err(|e| RaError::Configuration(format!("{}: {}", name, e)))
        })
        .transpose()
}

fn check_aid(name: &str, aid: &str) -> Result<()> {
    let bytes = hex::decode(aid)
        .map_err(|e| RaError::Configuration(format!("{} is not hex: {}", name, e)))?;
    if !(5..=16).contains(&bytes.len()) {
        return Err(RaError::Configuration(format!(
            "{} must be 5-16 bytes, got {}",
            name,
            bytes.len()
        )));
    }
    Ok(())
}

impl Args {
    pub fn tks_url_list(&self) -> Vec<String> {
        split_list(&self.tks_urls)
    }

    pub fn ca_url_list(&self) -> Vec<String> {
        split_list(&self.ca_urls)
    }

    pub fn drm_url_list(&self) -> Vec<String> {
        split_list(&self.drm_urls)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn log_flush_interval(&self) -> Duration {
        Duration::from_millis(self.log_flush_interval_ms)
    }

    /// Named keys from the configured hex values
    pub fn key_store(&self) -> Result<KeyStore> {
        let mut keys = KeyStore::new();
        if let Some(k) = parse_key("TRANSPORT_KEY", self.transport_key.as_deref())? {
            keys.insert(TRANSPORT_KEY_NAME, k);
        }
        if let Some(k) = parse_key("DRM_TRANSPORT_KEY", self.drm_transport_key.as_deref())? {
            keys.insert(DRM_TRANSPORT_KEY_NAME, k);
        }
        if let Some(k) = parse_key("MASTER_KEY", self.master_key.as_deref())? {
            keys.insert(MASTER_KEY_NAME, k);
        }
        Ok(keys)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        let keys = self.key_store()?;

        if keys.master_key().is_none() {
            if self.tks_url_list().is_empty() {
                return Err(RaError::Configuration(
                    "TKS_URLS is required when MASTER_KEY is not set".into(),
                ));
            }
            if keys.find(TRANSPORT_KEY_NAME).is_none() {
                return Err(RaError::Configuration(
                    "TRANSPORT_KEY is required to unwrap TKS session keys".into(),
                ));
            }
        } else if !self.drm_url_list().is_empty() && keys.find(DRM_TRANSPORT_KEY_NAME).is_none() {
            // Locally derived KEKs reach the DRM only wrapped under this key
            return Err(RaError::Configuration(
                "DRM_TRANSPORT_KEY is required when MASTER_KEY and DRM_URLS are both set".into(),
            ));
        }

        LogLevel::from_number(self.debug_log_level)?;
        LogLevel::from_number(self.error_log_level)?;

        if self.request_timeout_ms == 0 {
            return Err(RaError::Configuration("REQUEST_TIMEOUT_MS must be non-zero".into()));
        }
        if self.log_flush_interval_ms == 0 {
            return Err(RaError::Configuration("LOG_FLUSH_INTERVAL_MS must be non-zero".into()));
        }
        if self.log_buffer_size == 0 {
            return Err(RaError::Configuration("LOG_BUFFER_SIZE must be non-zero".into()));
        }

        check_aid("CARD_MANAGER_AID", &self.applet.card_manager_aid)?;
        check_aid("NETKEY_INSTANCE_AID", &self.applet.netkey_instance_aid)?;
        check_aid("NETKEY_FILE_AID", &self.applet.netkey_file_aid)?;
        check_aid("NETKEY_OLD_INSTANCE_AID", &self.applet.netkey_old_instance_aid)?;
        check_aid("NETKEY_OLD_FILE_AID", &self.applet.netkey_old_file_aid)?;

        TransitionTable::parse(&self.tokendb_allowed_transitions)?;
        TransitionTable::parse(&self.operations_allowed_transitions)?;

        Ok(())
    }

    /// Freeze the validated arguments.
    pub fn snapshot(&self) -> Result<ConfigSnapshot> {
        self.validate()?;
        Ok(ConfigSnapshot {
            tks_urls: self.tks_url_list(),
            ca_urls: self.ca_url_list(),
            drm_urls: self.drm_url_list(),
            request_timeout_ms: self.request_timeout_ms,
            local_diversification: self.master_key.is_some(),
            debug_log_level: LogLevel::from_number(self.debug_log_level)?,
            error_log_level: LogLevel::from_number(self.error_log_level)?,
            applet: AppletConfig {
                card_manager_aid: self.applet.card_manager_aid.to_uppercase(),
                netkey_instance_aid: self.applet.netkey_instance_aid.to_uppercase(),
                netkey_file_aid: self.applet.netkey_file_aid.to_uppercase(),
                netkey_old_instance_aid: self.applet.netkey_old_instance_aid.to_uppercase(),
                netkey_old_file_aid: self.applet.netkey_old_file_aid.to_uppercase(),
                so_pin: self.applet.applet_so_pin.clone(),
            },
            channel_sec_level: self.channel.channel_sec_level.clone(),
            channel_encryption: self.channel.channel_encryption,
            auths_enable: self.auth.auths_enable,
            auths_current_impl: self.auth.auths_current_impl.clone(),
            auths_plugins: split_list(&self.auth.auths_plugins),
            publisher_lib: self.publisher_lib.clone(),
            publisher_factory: self.publisher_factory.clone(),
            tokendb_transitions: TransitionTable::parse(&self.tokendb_allowed_transitions)?,
            operations_transitions: TransitionTable::parse(&self.operations_allowed_transitions)?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AppletConfig {
    pub card_manager_aid: String,
    pub netkey_instance_aid: String,
    pub netkey_file_aid: String,
    pub netkey_old_instance_aid: String,
    pub netkey_old_file_aid: String,
    #[serde(skip)]
    pub so_pin: String,
}

/// Immutable configuration resolved at startup.
///
/// Keys and PINs are never serialized.
#[derive(Debug, Clone, Serialize)]
pub struct ConfigSnapshot {
    pub tks_urls: Vec<String>,
    pub ca_urls: Vec<String>,
    pub drm_urls: Vec<String>,
    pub request_timeout_ms: u64,
    pub local_diversification: bool,
    pub debug_log_level: LogLevel,
    pub error_log_level: LogLevel,
    pub applet: AppletConfig,
    pub channel_sec_level: String,
    pub channel_encryption: bool,
    pub auths_enable: bool,
    pub auths_current_impl: String,
    pub auths_plugins: Vec<String>,
    pub publisher_lib: Option<String>,
    pub publisher_factory: Option<String>,
    pub tokendb_transitions: TransitionTable,
    pub operations_transitions: TransitionTable,
}

impl ConfigSnapshot {
    /// Snapshot with defaults everywhere and no backends, for tests and tools.
    pub fn empty() -> Self {
        Self {
            tks_urls: Vec::new(),
            ca_urls: Vec::new(),
            drm_urls: Vec::new(),
            request_timeout_ms: 30_000,
            local_diversification: false,
            debug_log_level: LogLevel::PerConnection,
            error_log_level: LogLevel::AllDataInPdu,
            applet: AppletConfig {
                card_manager_aid: DEFAULT_CARD_MANAGER_AID.into(),
                netkey_instance_aid: DEFAULT_NETKEY_INSTANCE_AID.into(),
                netkey_file_aid: DEFAULT_NETKEY_FILE_AID.into(),
                netkey_old_instance_aid: DEFAULT_NETKEY_OLD_INSTANCE_AID.into(),
                netkey_old_file_aid: DEFAULT_NETKEY_OLD_FILE_AID.into(),
                so_pin: DEFAULT_APPLET_SO_PIN.into(),
            },
            channel_sec_level: "SECURE_MSG_MAC_ENC".into(),
            channel_encryption: true,
            auths_enable: false,
            auths_current_impl: String::new(),
            auths_plugins: Vec::new(),
            publisher_lib: None,
            publisher_factory: None,
            tokendb_transitions: TransitionTable::default(),
            operations_transitions: TransitionTable::default(),
        }
    }
}

/// Allowed `from -> to` token state transitions.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TransitionTable {
    transitions: BTreeSet<(u32, u32)>,
}

impl TransitionTable {
    /// Parse `"from:to,from:to"`. Empty input allows nothing.
    pub fn parse(value: &str) -> Result<Self> {
        let mut transitions = BTreeSet::new();
        for entry in split_list(value) {
            let (from, to) = entry.split_once(':').ok_or_else(|| {
                RaError::Configuration(format!("Transition '{}' is not 'from:to'", entry))
            })?;
            let parse = |s: &str| {
                s.trim().parse::<u32>().map_err(|_| {
                    RaError::Configuration(format!("Transition '{}' has a non-numeric state", entry))
                })
            };
            transitions.insert((parse(from)?, parse(to)?));
        }
        Ok(Self { transitions })
    }

    pub fn is_allowed(&self, from: u32, to: u32) -> bool {
        self.transitions.contains(&(from, to))
    }

    pub fn len(&self) -> usize {
        self.transitions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.transitions.is_empty()
    }
}
