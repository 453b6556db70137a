use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{config::ConfigSchema, error::ManifestError};

/// One configurable field shown on the script settings page.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VarDescriptor {
    pub name: String,
    #[serde(default)]
    pub title: String,
    #[serde(rename = "type")]
    pub kind: VarKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub options: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub placeholder: Option<String>,
    #[serde(default)]
    pub indent: u8,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<VarCondition>,
    /// Row layout of an `array` variable.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub vars: Vec<VarDescriptor>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VarKind {
    String,
    Multiline,
    Password,
    Number,
    Checkbox,
    Select,
    Strings,
    Array,
    Channel,
}

impl VarKind {
    pub fn expects(self) -> &'static str {
        match self {
            VarKind::String | VarKind::Multiline | VarKind::Password => "a string",
            VarKind::Channel => "a channel id",
            VarKind::Number => "a number",
            VarKind::Checkbox => "a boolean",
            VarKind::Select => "an option index",
            VarKind::Strings => "a list of strings",
            VarKind::Array => "a list of rows",
        }
    }
}

/// Shows a variable only when an earlier variable holds `value`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VarCondition {
    pub field: String,
    pub value: Value,
}

impl VarDescriptor {
    pub fn new(name: impl Into<String>, kind: VarKind) -> Self {
        Self {
            name: name.into(),
            title: String::new(),
            kind,
            default: None,
            options: Vec::new(),
            placeholder: None,
            indent: 0,
            conditions: Vec::new(),
            vars: Vec::new(),
        }
    }

    pub fn with_default(mut self, default: Value) -> Self {
        self.default = Some(default);
        self
    }

    pub fn with_options<I, S>(mut self, options: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.options = options.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_condition(mut self, field: impl Into<String>, value: Value) -> Self {
        self.conditions.push(VarCondition {
            field: field.into(),
            value,
        });
        self
    }

    pub fn with_rows(mut self, vars: Vec<VarDescriptor>) -> Self {
        self.vars = vars;
        self
    }

    fn invalid(&self, reason: impl Into<String>) -> ManifestError {
        ManifestError::InvalidVar {
            name: self.name.clone(),
            reason: reason.into(),
        }
    }

    fn validate(&self, earlier: &HashSet<&str>) -> Result<(), ManifestError> {
        if self.name.trim().is_empty() {
            return Err(ManifestError::InvalidVar {
                name: String::new(),
                reason: "name must not be empty".into(),
            });
        }
        match self.kind {
            VarKind::Select if self.options.is_empty() => {
                return Err(self.invalid("select variables need at least one option"));
            }
            VarKind::Array if self.vars.is_empty() => {
                return Err(self.invalid("array variables need nested vars"));
            }
            VarKind::Array => validate_vars(&self.vars)?,
            _ => {}
        }
        if let Some(default) = &self.default {
            if !self.accepts_default(default) {
                return Err(self.invalid(format!("default must be {}", self.kind.expects())));
            }
            if self.kind == VarKind::Array {
                self.validate_default_rows(default)?;
            }
        }
        for condition in &self.conditions {
            if !earlier.contains(condition.field.as_str()) {
                return Err(self.invalid(format!(
                    "condition refers to `{}` which is not declared before it",
                    condition.field
                )));
            }
        }
        Ok(())
    }

    fn validate_default_rows(&self, default: &Value) -> Result<(), ManifestError> {
        let schema = ConfigSchema::from_vars(&self.vars);
        for (row, item) in default.as_array().into_iter().flatten().enumerate() {
            if !item.is_object() {
                return Err(self.invalid(format!("default row {row} must be an object")));
            }
            schema
                .resolve(item)
                .map_err(|err| self.invalid(format!("default row {row}: {err}")))?;
        }
        Ok(())
    }

    fn accepts_default(&self, default: &Value) -> bool {
        match self.kind {
            VarKind::String | VarKind::Multiline | VarKind::Password => default.is_string(),
            VarKind::Channel => default.is_string() || default.is_i64() || default.is_u64(),
            VarKind::Number => default.is_number(),
            VarKind::Checkbox => default.is_boolean(),
            VarKind::Select => default
                .as_u64()
                .is_some_and(|index| (index as usize) < self.options.len()),
            VarKind::Strings => default
                .as_array()
                .is_some_and(|items| items.iter().all(Value::is_string)),
            VarKind::Array => default.is_array(),
        }
    }
}

/// Checks names, kinds, defaults and condition references of a var list.
pub fn validate_vars(vars: &[VarDescriptor]) -> Result<(), ManifestError> {
    let mut seen = HashSet::new();
    for var in vars {
        var.validate(&seen)?;
        if !seen.insert(var.name.as_str()) {
            return Err(ManifestError::DuplicateVar(var.name.clone()));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn parses_settings_page_descriptor() {
        let var: VarDescriptor = serde_json::from_value(json!({
            "name": "mode",
            "title": "Greeting mode",
            "type": "select",
            "options": ["private", "channel"],
            "default": 1
        }))
        .unwrap();
        assert_eq!(var.kind, VarKind::Select);
        assert_eq!(var.options.len(), 2);
        assert!(validate_vars(&[var]).is_ok());
    }

    #[test]
    fn select_without_options_is_rejected() {
        let err = validate_vars(&[VarDescriptor::new("mode", VarKind::Select)]).unwrap_err();
        assert!(matches!(err, ManifestError::InvalidVar { ref name, .. } if name == "mode"));
    }

    #[test]
    fn default_must_match_kind() {
        let var = VarDescriptor::new("enabled", VarKind::Checkbox).with_default(json!("yes"));
        let err = validate_vars(&[var]).unwrap_err();
        assert_eq!(
            err.to_string(),
            "variable `enabled` is invalid: default must be a boolean"
        );
    }

    #[test]
    fn conditions_must_point_backwards() {
        let vars = vec![
            VarDescriptor::new("message", VarKind::String).with_condition("enabled", json!(true)),
            VarDescriptor::new("enabled", VarKind::Checkbox),
        ];
        assert!(validate_vars(&vars).is_err());

        let vars = vec![
            VarDescriptor::new("enabled", VarKind::Checkbox),
            VarDescriptor::new("message", VarKind::String).with_condition("enabled", json!(true)),
        ];
        assert!(validate_vars(&vars).is_ok());
    }

    #[test]
    fn duplicate_names_are_reported() {
        let vars = vec![
            VarDescriptor::new("a", VarKind::String),
            VarDescriptor::new("a", VarKind::Number),
        ];
        assert_eq!(
            validate_vars(&vars),
            Err(ManifestError::DuplicateVar("a".into()))
        );
    }

    #[test]
    fn array_rows_are_validated_recursively() {
        let rows = VarDescriptor::new("commands", VarKind::Array)
            .with_rows(vec![VarDescriptor::new("", VarKind::String)]);
        assert!(validate_vars(&[rows]).is_err());
        assert!(validate_vars(&[VarDescriptor::new("commands", VarKind::Array)]).is_err());
    }

    #[test]
    fn array_default_rows_are_checked_against_nested_vars() {
        let rows = vec![
            VarDescriptor::new("pattern", VarKind::String),
            VarDescriptor::new("weight", VarKind::Number).with_default(json!(1)),
        ];
        let good = VarDescriptor::new("rules", VarKind::Array)
            .with_rows(rows.clone())
            .with_default(json!([{"pattern": "hi"}, {"pattern": "bye", "weight": 3}]));
        assert!(validate_vars(&[good]).is_ok());

        let bad = VarDescriptor::new("rules", VarKind::Array)
            .with_rows(rows.clone())
            .with_default(json!([{"pattern": "hi"}, {"pattern": 7}]));
        let err = validate_vars(&[bad]).unwrap_err();
        assert!(matches!(err, ManifestError::InvalidVar { ref name, ref reason } if name == "rules" && reason.starts_with("default row 1")));

        let scalar_row = VarDescriptor::new("rules", VarKind::Array)
            .with_rows(rows)
            .with_default(json!(["hi"]));
        assert!(validate_vars(&[scalar_row]).is_err());
    }
}
