use std::{collections::HashMap, path::PathBuf, time::Duration};

use anyhow::{bail, Context, Result};
use scriptbot_plugin_sdk::{BackendKind, CapabilityName};
use semver::Version;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Root host configuration deserialized from TOML.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct HostConfig {
    pub host: HostSection,
    pub scripts: Scripts,
    pub store: StoreSection,
    pub http: HttpSection,
    pub fs: FsSection,
    pub capabilities: CapabilitySection,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HostSection {
    /// Host version matched against each manifest's `engine` range.
    pub version: String,
    pub instance_id: String,
    pub bot_id: String,
    pub backend: BackendKind,
    pub nick: String,
    /// Lets scripts trigger `engine.reload_scripts()`.
    pub allow_reload: bool,
}

impl Default for HostSection {
    fn default() -> Self {
        Self {
            version: env!("CARGO_PKG_VERSION").to_string(),
            instance_id: "default".into(),
            bot_id: "default".into(),
            backend: BackendKind::Ts3,
            nick: "ScriptBot".into(),
            allow_reload: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Scripts {
    /// Directories searched for `*.json` script manifests.
    pub search_paths: Vec<String>,
    /// Scripts started by `start_all` in addition to autorun ones.
    pub enabled: Vec<String>,
    /// Stored configuration per script name, as set on the settings page.
    pub config: HashMap<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct StoreSection {
    pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpSection {
    pub default_timeout_ms: u64,
    pub max_body_bytes: usize,
}

impl Default for HttpSection {
    fn default() -> Self {
        Self {
            default_timeout_ms: 10_000,
            max_body_bytes: 4 * 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FsSection {
    pub root: PathBuf,
}

impl Default for FsSection {
    fn default() -> Self {
        Self {
            root: PathBuf::from("data/files"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct CapabilitySection {
    /// Protected modules this host declines to provide.
    pub withheld: Vec<String>,
}

impl HostConfig {
    pub fn from_toml(input: &str) -> Result<Self> {
        toml::from_str(input).context("failed to parse host configuration")
    }

    /// Validates structural invariants and provides actionable error messages.
    pub fn validate(&self) -> Result<()> {
        if self.host.instance_id.trim().is_empty() {
            bail!("host.instance_id must not be empty");
        }
        if self.host.bot_id.trim().is_empty() {
            bail!("host.bot_id must not be empty");
        }
        self.host_version()?;
        if self.http.default_timeout_ms == 0 {
            bail!("http.default_timeout_ms must be greater than zero");
        }
        if self.http.max_body_bytes == 0 {
            bail!("http.max_body_bytes must be greater than zero");
        }
        self.withheld()?;
        for (name, value) in &self.scripts.config {
            if !value.is_object() {
                bail!("scripts.config.{name} must be a table");
            }
        }
        Ok(())
    }

    /// The host version; `1.0` is read as `1.0.0`.
    pub fn host_version(&self) -> Result<Version> {
        parse_lenient_version(&self.host.version)
            .with_context(|| format!("host.version `{}` is not a valid version", self.host.version))
    }

    pub fn withheld(&self) -> Result<Vec<CapabilityName>> {
        self.capabilities
            .withheld
            .iter()
            .map(|raw| {
                let name: CapabilityName = raw
                    .parse()
                    .with_context(|| format!("capabilities.withheld contains `{raw}`"))?;
                if !name.is_protected() {
                    bail!("`{name}` is not protected and cannot be withheld");
                }
                Ok(name)
            })
            .collect()
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_millis(self.http.default_timeout_ms)
    }
}

pub(crate) fn parse_lenient_version(raw: &str) -> Result<Version> {
    let trimmed = raw.trim();
    if let Ok(version) = Version::parse(trimmed) {
        return Ok(version);
    }
    let (core, rest) = match trimmed.find(&['-', '+'][..]) {
        Some(pos) => trimmed.split_at(pos),
        None => (trimmed, ""),
    };
    let padded = match core.split('.').count() {
        1 => format!("{core}.0.0{rest}"),
        2 => format!("{core}.0{rest}"),
        _ => bail!("unrecognised version `{raw}`"),
    };
    Ok(Version::parse(&padded)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_versions_are_padded() {
        assert_eq!(parse_lenient_version("1.0").unwrap(), Version::new(1, 0, 0));
        assert_eq!(parse_lenient_version("2").unwrap(), Version::new(2, 0, 0));
        assert_eq!(
            parse_lenient_version("1.0-beta.6").unwrap().to_string(),
            "1.0.0-beta.6"
        );
        assert!(parse_lenient_version("one").is_err());
    }

    #[test]
    fn parses_sections_and_script_tables() {
        let cfg = HostConfig::from_toml(
            r#"
            [host]
            version = "1.0.0-beta.9"
            instance_id = "inst-1"
            backend = "discord"

            [scripts]
            enabled = ["greeter"]

            [scripts.config.greeter]
            message = "hi"
            delay = 3

            [capabilities]
            withheld = ["fs"]
            "#,
        )
        .unwrap();
        cfg.validate().unwrap();
        assert_eq!(cfg.host.backend, BackendKind::Discord);
        assert_eq!(cfg.host.bot_id, "default");
        assert_eq!(cfg.scripts.config["greeter"]["message"], "hi");
        assert!(!cfg.scripts.config.contains_key("missing"));
        assert_eq!(cfg.withheld().unwrap(), vec![CapabilityName::Fs]);
    }

    #[test]
    fn unprotected_modules_cannot_be_withheld() {
        let mut cfg = HostConfig::default();
        cfg.capabilities.withheld = vec!["store".into()];
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("not protected"));
    }

    #[test]
    fn empty_instance_id_is_rejected() {
        let mut cfg = HostConfig::default();
        cfg.host.instance_id = " ".into();
        assert!(cfg.validate().is_err());
    }
}
