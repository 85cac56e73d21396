//! Service configuration.
//!
//! Settings are read from a TOML file in which every section is optional,
//! then overridden from the environment and validated. The `[leaf]` and
//! `[collection]` sections hold the defaults applied to newly created nodes.

use std::path::PathBuf;

use jid::Jid;
use serde::Deserialize;

use crate::node::{
    AccessModel, CollectionConfig, LeafConfig, LeafNodeAssociationPolicy, NodeConfig,
    PublisherModel,
};

#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    #[error("settings file not found at {path}")]
    FileNotFound { path: PathBuf },

    #[error("invalid TOML at line {line}, column {column}: {message}")]
    InvalidToml {
        line: usize,
        column: usize,
        message: String,
    },

    #[error("invalid value for {field}: {message}")]
    InvalidValue { field: String, message: String },

    #[error("I/O error reading settings: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PubSubSettings {
    #[serde(default)]
    pub service: ServiceSettings,
    #[serde(default)]
    pub leaf: LeafDefaults,
    #[serde(default)]
    pub collection: CollectionDefaults,
    #[serde(default)]
    pub logging: LoggingSettings,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServiceSettings {
    /// Address of the pubsub service. Creator of the root node.
    #[serde(default = "default_address")]
    pub address: String,
    #[serde(default)]
    pub root_node_id: String,
    /// Service-wide administrators.
    #[serde(default)]
    pub admins: Vec<String>,
}

impl Default for ServiceSettings {
    fn default() -> Self {
        Self {
            address: default_address(),
            root_node_id: String::new(),
            admins: Vec::new(),
        }
    }
}

impl ServiceSettings {
    pub fn address_jid(&self) -> Result<Jid, SettingsError> {
        parse_jid("service.address", &self.address)
    }

    pub fn admin_jids(&self) -> Result<Vec<Jid>, SettingsError> {
        self.admins
            .iter()
            .map(|admin| parse_jid("service.admins", admin))
            .collect()
    }
}

/// Defaults for new leaf nodes.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LeafDefaults {
    pub deliver_payloads: bool,
    pub notify_config: bool,
    pub notify_delete: bool,
    pub notify_retract: bool,
    pub presence_based_delivery: bool,
    pub send_item_subscribe: bool,
    pub subscribe: bool,
    pub subscription_required: bool,
    pub access_model: AccessModel,
    pub publisher_model: PublisherModel,
    pub persist_items: bool,
    pub max_items: usize,
    pub max_payload_size: usize,
}

impl Default for LeafDefaults {
    fn default() -> Self {
        let config = NodeConfig::leaf_default();
        let leaf = LeafConfig::default();
        Self {
            deliver_payloads: config.deliver_payloads,
            notify_config: config.notify_config,
            notify_delete: config.notify_delete,
            notify_retract: config.notify_retract,
            presence_based_delivery: config.presence_based_delivery,
            send_item_subscribe: config.send_item_subscribe,
            subscribe: config.subscribe,
            subscription_required: config.subscription_required,
            access_model: config.access_model,
            publisher_model: config.publisher_model,
            persist_items: leaf.persist_items,
            max_items: leaf.max_items,
            max_payload_size: leaf.max_payload_size,
        }
    }
}

impl LeafDefaults {
    pub fn node_config(&self) -> NodeConfig {
        NodeConfig {
            deliver_payloads: self.deliver_payloads,
            notify_config: self.notify_config,
            notify_delete: self.notify_delete,
            notify_retract: self.notify_retract,
            presence_based_delivery: self.presence_based_delivery,
            send_item_subscribe: self.send_item_subscribe,
            subscribe: self.subscribe,
            subscription_required: self.subscription_required,
            access_model: self.access_model,
            publisher_model: self.publisher_model,
            ..NodeConfig::leaf_default()
        }
    }

    pub fn leaf_config(&self) -> LeafConfig {
        LeafConfig {
            persist_items: self.persist_items,
            max_items: self.max_items,
            max_payload_size: self.max_payload_size,
        }
    }
}

/// Defaults for new collection nodes.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CollectionDefaults {
    pub deliver_payloads: bool,
    pub notify_config: bool,
    pub notify_delete: bool,
    pub notify_retract: bool,
    pub presence_based_delivery: bool,
    pub send_item_subscribe: bool,
    pub subscribe: bool,
    pub subscription_required: bool,
    pub access_model: AccessModel,
    pub publisher_model: PublisherModel,
    pub association_policy: LeafNodeAssociationPolicy,
    pub max_leaf_nodes: i32,
}

impl Default for CollectionDefaults {
    fn default() -> Self {
        let config = NodeConfig::collection_default();
        let collection = CollectionConfig::default();
        Self {
            deliver_payloads: config.deliver_payloads,
            notify_config: config.notify_config,
            notify_delete: config.notify_delete,
            notify_retract: config.notify_retract,
            presence_based_delivery: config.presence_based_delivery,
            send_item_subscribe: config.send_item_subscribe,
            subscribe: config.subscribe,
            subscription_required: config.subscription_required,
            access_model: config.access_model,
            publisher_model: config.publisher_model,
            association_policy: collection.association_policy,
            max_leaf_nodes: collection.max_leaf_nodes,
        }
    }
}

impl CollectionDefaults {
    pub fn node_config(&self) -> NodeConfig {
        NodeConfig {
            deliver_payloads: self.deliver_payloads,
            notify_config: self.notify_config,
            notify_delete: self.notify_delete,
            notify_retract: self.notify_retract,
            presence_based_delivery: self.presence_based_delivery,
            send_item_subscribe: self.send_item_subscribe,
            subscribe: self.subscribe,
            subscription_required: self.subscription_required,
            access_model: self.access_model,
            publisher_model: self.publisher_model,
            ..NodeConfig::collection_default()
        }
    }

    pub fn collection_config(&self) -> CollectionConfig {
        CollectionConfig {
            association_policy: self.association_policy,
            max_leaf_nodes: self.max_leaf_nodes,
            ..CollectionConfig::default()
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingSettings {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

#[derive(Debug, Default, Clone)]
struct SettingsOverrides {
    address: Option<String>,
    admins: Option<String>,
    log_level: Option<String>,
}

fn default_address() -> String {
    "pubsub.localhost".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

const VALID_LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

/// Load settings from a file, merging environment variable overrides.
pub fn load_settings_from(path: PathBuf) -> Result<PubSubSettings, SettingsError> {
    load_settings_from_with_overrides(path, settings_overrides_from_env())
}

/// Parse settings from a TOML string, merging environment variable overrides.
pub fn load_settings_from_str(toml_str: &str) -> Result<PubSubSettings, SettingsError> {
    load_settings_from_str_with_overrides(toml_str, settings_overrides_from_env())
}

fn load_settings_from_with_overrides(
    path: PathBuf,
    overrides: SettingsOverrides,
) -> Result<PubSubSettings, SettingsError> {
    let contents = match std::fs::read_to_string(&path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(SettingsError::FileNotFound { path });
        }
        Err(e) => return Err(SettingsError::Io(e)),
    };

    load_settings_from_str_with_overrides(&contents, overrides)
}

fn load_settings_from_str_with_overrides(
    toml_str: &str,
    overrides: SettingsOverrides,
) -> Result<PubSubSettings, SettingsError> {
    let mut settings: PubSubSettings = toml::from_str(toml_str).map_err(|e| {
        let (line, column) = e.span().map_or((0, 0), |span| {
            let before = &toml_str[..span.start];
            let line = before.chars().filter(|&c| c == '\n').count() + 1;
            let column = before
                .rfind('\n')
                .map_or(span.start + 1, |nl| span.start - nl);
            (line, column)
        });
        SettingsError::InvalidToml {
            line,
            column,
            message: e.message().to_string(),
        }
    })?;

    apply_overrides(&mut settings, overrides);
    validate(&settings)?;

    Ok(settings)
}

fn settings_overrides_from_env() -> SettingsOverrides {
    SettingsOverrides {
        address: std::env::var("WADDLE_PUBSUB_ADDRESS").ok(),
        admins: std::env::var("WADDLE_PUBSUB_ADMINS").ok(),
        log_level: std::env::var("WADDLE_LOG_LEVEL").ok(),
    }
}

fn apply_overrides(settings: &mut PubSubSettings, overrides: SettingsOverrides) {
    if let Some(address) = overrides.address {
        settings.service.address = address;
    }
    if let Some(admins) = overrides.admins {
        settings.service.admins = admins
            .split(',')
            .map(str::trim)
            .filter(|admin| !admin.is_empty())
            .map(str::to_string)
            .collect();
    }
    if let Some(level) = overrides.log_level {
        settings.logging.level = level;
    }
}

fn validate(settings: &PubSubSettings) -> Result<(), SettingsError> {
    settings.service.address_jid()?;
    settings.service.admin_jids()?;

    if settings.leaf.max_items == 0 {
        return Err(SettingsError::InvalidValue {
            field: "leaf.max_items".to_string(),
            message: "must be at least 1".to_string(),
        });
    }

    if !VALID_LOG_LEVELS.contains(&settings.logging.level.as_str()) {
        return Err(SettingsError::InvalidValue {
            field: "logging.level".to_string(),
            message: format!("must be one of: {}", VALID_LOG_LEVELS.join(", ")),
        });
    }

    Ok(())
}

fn parse_jid(field: &str, value: &str) -> Result<Jid, SettingsError> {
    value.parse().map_err(|e| SettingsError::InvalidValue {
        field: field.to_string(),
        message: format!("'{}' is not a valid JID: {}", value, e),
    })
}
