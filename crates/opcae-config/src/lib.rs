//! Server profiles and subscription defaults for opcae consumers.
//!
//! TOML on disk, overridable through `OPCAE_` environment variables, and
//! translation into `opcae_core::ServerTarget` / `opcae_core::SubscriptionConfig`.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use directories::ProjectDirs;
use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use opcae_core::{Backpressure, Guid, ServerId, ServerTarget, SubscriptionConfig};

// ── Error ───────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid {field}: {reason}")]
    Validation { field: String, reason: String },

    #[error("no server profile named '{name}'")]
    UnknownServer { name: String },

    #[error("no server given and no default_server configured")]
    NoDefaultServer,

    #[error("failed to serialize config: {0}")]
    Serialization(#[from] toml::ser::Error),

    #[error("config loading failed: {0}")]
    Figment(Box<figment::Error>),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<figment::Error> for ConfigError {
    fn from(err: figment::Error) -> Self {
        Self::Figment(Box::new(err))
    }
}

impl From<ConfigError> for opcae_core::CoreError {
    fn from(err: ConfigError) -> Self {
        Self::Config {
            message: err.to_string(),
        }
    }
}

fn invalid(field: &str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Validation {
        field: field.into(),
        reason: reason.into(),
    }
}

// ── TOML config structs ─────────────────────────────────────────────

/// Top-level TOML configuration.
#[derive(Debug, Default, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct Config {
    /// Profile used when the caller names none.
    pub default_server: Option<String>,

    /// Subscription defaults applied to every profile.
    #[serde(default)]
    pub defaults: Defaults,

    /// Named server profiles.
    #[serde(default)]
    pub servers: BTreeMap<String, ServerProfile>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct Defaults {
    #[serde(default = "default_active")]
    pub active: bool,

    #[serde(default = "default_buffer_time_ms")]
    pub buffer_time_ms: u32,

    #[serde(default)]
    pub max_size: u32,

    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    /// "wait", "drop-oldest" or "drop-newest".
    #[serde(default = "default_backpressure")]
    pub backpressure: String,

    /// How long "wait" blocks the delivery thread before dropping.
    #[serde(default = "default_wait_timeout_ms")]
    pub wait_timeout_ms: u64,
}

impl Default for Defaults {
    fn default() -> Self {
        Self {
            active: default_active(),
            buffer_time_ms: default_buffer_time_ms(),
            max_size: 0,
            queue_capacity: default_queue_capacity(),
            backpressure: default_backpressure(),
            wait_timeout_ms: default_wait_timeout_ms(),
        }
    }
}

fn default_active() -> bool {
    true
}
fn default_buffer_time_ms() -> u32 {
    1000
}
fn default_queue_capacity() -> usize {
    256
}
fn default_backpressure() -> String {
    "wait".into()
}
fn default_wait_timeout_ms() -> u64 {
    1000
}

/// A named server profile. Exactly one of `clsid` and `prog_id` is set;
/// the remaining fields override [`Defaults`] for this server only.
#[derive(Debug, Default, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct ServerProfile {
    /// Class id, braced or bare (e.g. "{6E3D7B1A-...}").
    pub clsid: Option<String>,

    /// Programmatic id (e.g. "Vendor.AlarmServer.1").
    pub prog_id: Option<String>,

    /// Host running the server. Empty or absent means this machine.
    #[serde(default)]
    pub node: String,

    pub active: Option<bool>,
    pub buffer_time_ms: Option<u32>,
    pub max_size: Option<u32>,
    pub queue_capacity: Option<usize>,
    pub backpressure: Option<String>,
    pub wait_timeout_ms: Option<u64>,
}

impl Config {
    /// Look up `name`, or the configured default when `name` is `None`.
    pub fn server(&self, name: Option<&str>) -> Result<(&str, &ServerProfile), ConfigError> {
        let name = match name {
            Some(name) => name,
            None => self.default_server.as_deref().ok_or(ConfigError::NoDefaultServer)?,
        };
        self.servers
            .get_key_value(name)
            .map(|(key, profile)| (key.as_str(), profile))
            .ok_or_else(|| ConfigError::UnknownServer { name: name.into() })
    }
}

// ── Config file path ────────────────────────────────────────────────

/// Resolve the config file path via XDG / platform conventions.
pub fn config_path() -> PathBuf {
    ProjectDirs::from("org", "opcae", "opcae").map_or_else(
        || {
            let mut p = dirs_fallback();
            p.push("config.toml");
            p
        },
        |dirs| dirs.config_dir().join("config.toml"),
    )
}

fn dirs_fallback() -> PathBuf {
    let mut p = PathBuf::from(std::env::var("HOME").unwrap_or_else(|_| ".".into()));
    p.push(".config");
    p.push("opcae");
    p
}

// ── Config loading ──────────────────────────────────────────────────

/// Load the full Config from the canonical file + environment.
pub fn load_config() -> Result<Config, ConfigError> {
    load_config_from(&config_path())
}

/// Load from `path` (a missing file contributes nothing), then apply
/// `OPCAE_` variables; nested keys use a double underscore, as in
/// `OPCAE_DEFAULTS__BUFFER_TIME_MS=250`.
pub fn load_config_from(path: &Path) -> Result<Config, ConfigError> {
    let figment = Figment::new()
        .merge(Serialized::defaults(Config::default()))
        .merge(Toml::file(path))
        .merge(Env::prefixed("OPCAE_").split("__"));

    let config: Config = figment.extract()?;
    debug!(path = %path.display(), servers = config.servers.len(), "config loaded");
    Ok(config)
}

/// Load config, returning a default if the file doesn't exist or is unreadable.
pub fn load_config_or_default() -> Config {
    load_config().unwrap_or_default()
}

// ── Config saving ───────────────────────────────────────────────────

/// Serialize config to TOML and write to the canonical config path.
pub fn save_config(cfg: &Config) -> Result<(), ConfigError> {
    save_config_to(cfg, &config_path())
}

pub fn save_config_to(cfg: &Config, path: &Path) -> Result<(), ConfigError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let toml_str = toml::to_string_pretty(cfg)?;
    std::fs::write(path, toml_str)?;
    debug!(path = %path.display(), "config saved");
    Ok(())
}

// ── Translation to opcae-core ───────────────────────────────────────

/// Build the activation target a profile names.
pub fn profile_target(profile: &ServerProfile) -> Result<ServerTarget, ConfigError> {
    let server = match (profile.clsid.as_deref(), profile.prog_id.as_deref()) {
        (Some(clsid), None) => {
            let guid: Guid = clsid
                .parse()
                .map_err(|_| invalid("clsid", format!("not a GUID: '{clsid}'")))?;
            ServerId::Clsid(guid)
        }
        (None, Some(prog_id)) if !prog_id.trim().is_empty() => ServerId::ProgId(prog_id.trim().into()),
        (None, Some(_)) => return Err(invalid("prog_id", "must not be empty")),
        (Some(_), Some(_)) => return Err(invalid("server", "set either clsid or prog_id, not both")),
        (None, None) => return Err(invalid("server", "one of clsid or prog_id is required")),
    };
    Ok(ServerTarget::remote(server, profile.node.trim()))
}

fn parse_backpressure(name: &str, wait_timeout_ms: u64) -> Result<Backpressure, ConfigError> {
    match name {
        "wait" => Ok(Backpressure::Wait {
            timeout: Duration::from_millis(wait_timeout_ms),
        }),
        "drop-oldest" => Ok(Backpressure::DropOldest),
        "drop-newest" => Ok(Backpressure::DropNewest),
        other => Err(invalid(
            "backpressure",
            format!("expected 'wait', 'drop-oldest', or 'drop-newest', got '{other}'"),
        )),
    }
}

/// Merge a profile's overrides onto the global defaults.
pub fn subscription_config(defaults: &Defaults, profile: &ServerProfile) -> Result<SubscriptionConfig, ConfigError> {
    let queue_capacity = profile.queue_capacity.unwrap_or(defaults.queue_capacity);
    if queue_capacity == 0 {
        return Err(invalid("queue_capacity", "must be at least 1"));
    }

    let backpressure = parse_backpressure(
        profile.backpressure.as_deref().unwrap_or(&defaults.backpressure),
        profile.wait_timeout_ms.unwrap_or(defaults.wait_timeout_ms),
    )?;

    Ok(SubscriptionConfig {
        active: profile.active.unwrap_or(defaults.active),
        buffer_time_ms: profile.buffer_time_ms.unwrap_or(defaults.buffer_time_ms),
        max_size: profile.max_size.unwrap_or(defaults.max_size),
        queue_capacity,
        backpressure,
    })
}

/// Resolve a server by name (or the default) to everything needed to
/// connect and subscribe.
pub fn resolve_server(
    cfg: &Config,
    name: Option<&str>,
) -> Result<(ServerTarget, SubscriptionConfig), ConfigError> {
    let (_, profile) = cfg.server(name)?;
    Ok((profile_target(profile)?, subscription_config(&cfg.defaults, profile)?))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn prog(prog_id: &str) -> ServerProfile {
        ServerProfile {
            prog_id: Some(prog_id.into()),
            ..ServerProfile::default()
        }
    }

    #[test]
    fn target_from_prog_id_and_node() {
        let profile = ServerProfile {
            node: " scada01 ".into(),
            ..prog("Vendor.AE.1")
        };
        let target = profile_target(&profile).unwrap();
        assert_eq!(target, ServerTarget::remote(ServerId::ProgId("Vendor.AE.1".into()), "scada01"));
        assert!(!target.is_local());
    }

    #[test]
    fn target_from_braced_clsid() {
        let profile = ServerProfile {
            clsid: Some("{6E3D7B1A-0C4F-4E21-9D5B-2F1A3C4D5E6F}".into()),
            ..ServerProfile::default()
        };
        let target = profile_target(&profile).unwrap();
        assert!(target.is_local());
        assert!(matches!(target.server, ServerId::Clsid(_)));
        assert_eq!(
            target.to_string().to_ascii_uppercase(),
            "{6E3D7B1A-0C4F-4E21-9D5B-2F1A3C4D5E6F}"
        );
    }

    #[test]
    fn target_requires_exactly_one_id() {
        let both = ServerProfile {
            clsid: Some("6E3D7B1A-0C4F-4E21-9D5B-2F1A3C4D5E6F".into()),
            ..prog("Vendor.AE.1")
        };
        for (profile, field) in [
            (both, "server"),
            (ServerProfile::default(), "server"),
            (prog("  "), "prog_id"),
            (
                ServerProfile {
                    clsid: Some("not-a-guid".into()),
                    ..ServerProfile::default()
                },
                "clsid",
            ),
        ] {
            match profile_target(&profile) {
                Err(ConfigError::Validation { field: got, .. }) => assert_eq!(got, field),
                other => panic!("expected validation error on {field}, got {other:?}"),
            }
        }
    }

    #[test]
    fn profile_overrides_defaults() {
        let defaults = Defaults::default();
        let plain = subscription_config(&defaults, &prog("A")).unwrap();
        assert_eq!(plain, SubscriptionConfig::default());

        let tuned = ServerProfile {
            active: Some(false),
            buffer_time_ms: Some(0),
            max_size: Some(50),
            backpressure: Some("drop-oldest".into()),
            ..prog("A")
        };
        let config = subscription_config(&defaults, &tuned).unwrap();
        assert!(!config.active);
        assert_eq!(config.buffer_time_ms, 0);
        assert_eq!(config.max_size, 50);
        assert_eq!(config.queue_capacity, 256);
        assert_eq!(config.backpressure, Backpressure::DropOldest);
    }

    #[test]
    fn wait_timeout_comes_from_profile_or_defaults() {
        let defaults = Defaults {
            wait_timeout_ms: 250,
            ..Defaults::default()
        };
        let config = subscription_config(&defaults, &prog("A")).unwrap();
        assert_eq!(
            config.backpressure,
            Backpressure::Wait {
                timeout: Duration::from_millis(250)
            }
        );

        let profile = ServerProfile {
            wait_timeout_ms: Some(5),
            ..prog("A")
        };
        let config = subscription_config(&defaults, &profile).unwrap();
        assert_eq!(
            config.backpressure,
            Backpressure::Wait {
                timeout: Duration::from_millis(5)
            }
        );
    }

    #[test]
    fn bad_policy_and_capacity_are_rejected() {
        let defaults = Defaults::default();
        let err = subscription_config(
            &defaults,
            &ServerProfile {
                backpressure: Some("block".into()),
                ..prog("A")
            },
        )
        .unwrap_err();
        assert_eq!(
            err.to_string(),
            "invalid backpressure: expected 'wait', 'drop-oldest', or 'drop-newest', got 'block'"
        );

        let err = subscription_config(
            &defaults,
            &ServerProfile {
                queue_capacity: Some(0),
                ..prog("A")
            },
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::Validation { ref field, .. } if field == "queue_capacity"));
    }

    #[test]
    fn config_errors_surface_as_core_errors() {
        let err: opcae_core::CoreError = invalid("node", "empty").into();
        assert_eq!(err.to_string(), "Configuration error: invalid node: empty");
    }

    #[test]
    fn server_lookup_uses_default_name() {
        let mut cfg = Config::default();
        assert!(matches!(cfg.server(None), Err(ConfigError::NoDefaultServer)));

        cfg.servers.insert("plant".into(), prog("Vendor.AE.1"));
        cfg.default_server = Some("plant".into());
        let (name, profile) = cfg.server(None).unwrap();
        assert_eq!(name, "plant");
        assert_eq!(profile.prog_id.as_deref(), Some("Vendor.AE.1"));

        let err = cfg.server(Some("lab")).unwrap_err();
        assert_eq!(err.to_string(), "no server profile named 'lab'");
    }
}
