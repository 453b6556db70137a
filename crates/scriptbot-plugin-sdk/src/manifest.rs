use std::{collections::BTreeSet, fmt, str::FromStr};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{
    capability::CapabilityName,
    config::ConfigSchema,
    error::ManifestError,
    vars::{validate_vars, VarDescriptor},
};

const REQUIRED_FIELDS: [&str; 4] = ["name", "author", "description", "version"];

/// Metadata a script hands to the host when it registers. Field names follow
/// the JSON shape scripts already use (`requiredModules`, `enableWeb`, ...).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Manifest {
    pub name: String,
    pub author: String,
    pub description: String,
    pub version: String,
    #[serde(default)]
    pub autorun: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub backends: Vec<BackendKind>,
    #[serde(default)]
    pub enable_web: bool,
    /// Required host version range, e.g. `>= 0.9.16`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub engine: Option<String>,
    #[serde(default)]
    pub hidden: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub required_modules: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub vars: Vec<VarDescriptor>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub voice_commands: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Ts3,
    Discord,
}

impl BackendKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            BackendKind::Ts3 => "ts3",
            BackendKind::Discord => "discord",
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackendKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ts3" => Ok(BackendKind::Ts3),
            "discord" => Ok(BackendKind::Discord),
            other => Err(format!("unknown backend `{other}` (expected ts3 or discord)")),
        }
    }
}

impl Manifest {
    pub fn new(
        name: impl Into<String>,
        author: impl Into<String>,
        description: impl Into<String>,
        version: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            author: author.into(),
            description: description.into(),
            version: version.into(),
            autorun: false,
            backends: Vec::new(),
            enable_web: false,
            engine: None,
            hidden: false,
            required_modules: Vec::new(),
            vars: Vec::new(),
            voice_commands: Vec::new(),
        }
    }

    pub fn with_modules<I, S>(mut self, modules: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.required_modules = modules.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_vars(mut self, vars: Vec<VarDescriptor>) -> Self {
        self.vars = vars;
        self
    }

    pub fn with_engine(mut self, range: impl Into<String>) -> Self {
        self.engine = Some(range.into());
        self
    }

    pub fn with_backends(mut self, backends: Vec<BackendKind>) -> Self {
        self.backends = backends;
        self
    }

    pub fn hidden(mut self) -> Self {
        self.hidden = true;
        self
    }

    pub fn autorun(mut self) -> Self {
        self.autorun = true;
        self
    }

    /// Parses a JSON manifest, reporting the first missing required field by
    /// name instead of a generic decode error.
    pub fn from_json(input: &str) -> Result<Self, ManifestError> {
        let raw: Value =
            serde_json::from_str(input).map_err(|err| ManifestError::Parse(err.to_string()))?;
        Self::from_value(raw)
    }

    pub fn from_value(raw: Value) -> Result<Self, ManifestError> {
        let object = raw
            .as_object()
            .ok_or_else(|| ManifestError::Parse("manifest must be a JSON object".into()))?;
        for field in REQUIRED_FIELDS {
            if object.get(field).map_or(true, Value::is_null) {
                return Err(ManifestError::MissingField(field));
            }
        }
        serde_json::from_value(raw).map_err(|err| ManifestError::Parse(err.to_string()))
    }

    /// Structural checks the host runs before a script is accepted.
    pub fn validate(&self) -> Result<(), ManifestError> {
        let required = [
            ("name", &self.name),
            ("author", &self.author),
            ("description", &self.description),
            ("version", &self.version),
        ];
        for (field, value) in required {
            if value.trim().is_empty() {
                return Err(ManifestError::MissingField(field));
            }
        }
        if self.hidden && !self.vars.is_empty() {
            return Err(ManifestError::HiddenWithVars);
        }
        validate_vars(&self.vars)
    }

    /// Backends the script runs on; scripts that declare none are ts3-only.
    pub fn effective_backends(&self) -> Vec<BackendKind> {
        if self.backends.is_empty() {
            vec![BackendKind::Ts3]
        } else {
            self.backends.clone()
        }
    }

    pub fn supports_backend(&self, backend: BackendKind) -> bool {
        self.effective_backends().contains(&backend)
    }

    /// Whether `name` appears in `requiredModules`.
    pub fn declares(&self, name: CapabilityName) -> bool {
        self.required_modules.iter().any(|m| m == name.as_str())
    }

    /// Declared modules that parse as known capability names.
    pub fn declared_capabilities(&self) -> BTreeSet<CapabilityName> {
        self.required_modules
            .iter()
            .filter_map(|m| m.parse().ok())
            .collect()
    }

    pub fn schema(&self) -> ConfigSchema {
        ConfigSchema::from_vars(&self.vars)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::vars::VarKind;

    fn base() -> Manifest {
        Manifest::new("T", "A", "D", "1.0")
    }

    #[test]
    fn parses_wire_field_names() {
        let manifest = Manifest::from_json(
            r#"{
                "name": "Demo Script",
                "version": "1.0",
                "description": "does nothing",
                "author": "Author <author@example.com>",
                "enableWeb": true,
                "requiredModules": ["http", "db"],
                "voiceCommands": ["play"],
                "backends": ["ts3", "discord"],
                "engine": ">= 0.9.16",
                "vars": []
            }"#,
        )
        .unwrap();
        assert!(manifest.enable_web);
        assert_eq!(manifest.required_modules, vec!["http", "db"]);
        assert_eq!(manifest.voice_commands, vec!["play"]);
        assert!(manifest.supports_backend(BackendKind::Discord));
        assert_eq!(manifest.engine.as_deref(), Some(">= 0.9.16"));
        assert!(manifest.validate().is_ok());
    }

    #[test]
    fn each_required_field_is_reported_when_missing() {
        for field in REQUIRED_FIELDS {
            let mut raw = json!({"name": "T", "author": "A", "description": "D", "version": "1.0"});
            raw.as_object_mut().unwrap().remove(field);
            assert_eq!(
                Manifest::from_value(raw),
                Err(ManifestError::MissingField(field))
            );
        }
    }

    #[test]
    fn blank_required_field_fails_validation() {
        let mut manifest = base();
        manifest.author = "   ".into();
        assert_eq!(manifest.validate(), Err(ManifestError::MissingField("author")));
    }

    #[test]
    fn hidden_script_cannot_expose_vars() {
        let manifest = base()
            .hidden()
            .with_vars(vec![VarDescriptor::new("greeting", VarKind::String)]);
        assert_eq!(manifest.validate(), Err(ManifestError::HiddenWithVars));
        assert!(base().hidden().validate().is_ok());
    }

    #[test]
    fn default_backend_is_ts3() {
        let manifest = base();
        assert!(manifest.supports_backend(BackendKind::Ts3));
        assert!(!manifest.supports_backend(BackendKind::Discord));
    }

    #[test]
    fn unknown_backend_is_a_parse_error() {
        let err = Manifest::from_value(json!({
            "name": "T", "author": "A", "description": "D", "version": "1.0",
            "backends": ["irc"]
        }))
        .unwrap_err();
        assert!(matches!(err, ManifestError::Parse(_)));
    }

    #[test]
    fn declared_capabilities_skip_unknown_names() {
        let manifest = base().with_modules(["db", "sql", "http"]);
        assert!(manifest.declares(CapabilityName::Db));
        assert!(!manifest.declares(CapabilityName::Fs));
        let declared: Vec<_> = manifest.declared_capabilities().into_iter().collect();
        assert_eq!(declared, vec![CapabilityName::Db, CapabilityName::Http]);
    }
}
