//! Typed script configuration.
//!
//! A manifest's `vars` list is the schema for the configuration object the
//! host passes to the script. [`ConfigSchema::resolve`] checks a stored JSON
//! object against that schema, fills in declared defaults and produces a
//! [`ScriptConfig`] whose values already carry their kind.

use std::collections::BTreeMap;

use serde::de::DeserializeOwned;
use serde_json::{Map, Number, Value};

use crate::{
    error::ConfigError,
    vars::{VarDescriptor, VarKind},
};

#[derive(Debug, Clone, PartialEq)]
pub enum ConfigValue {
    Text(String),
    Number(f64),
    Flag(bool),
    Choice { index: usize, label: String },
    Strings(Vec<String>),
    Rows(Vec<ScriptConfig>),
}

impl ConfigValue {
    /// JSON form as stored by the host. Selects are written back as their
    /// option index.
    pub fn to_json(&self) -> Value {
        match self {
            ConfigValue::Text(text) => Value::String(text.clone()),
            ConfigValue::Number(number) => number_to_json(*number),
            ConfigValue::Flag(flag) => Value::Bool(*flag),
            ConfigValue::Choice { index, .. } => Value::from(*index),
            ConfigValue::Strings(items) => {
                Value::Array(items.iter().cloned().map(Value::String).collect())
            }
            ConfigValue::Rows(rows) => Value::Array(rows.iter().map(ScriptConfig::to_json).collect()),
        }
    }
}

fn number_to_json(number: f64) -> Value {
    if number.fract() == 0.0 && number.abs() < i64::MAX as f64 {
        Value::from(number as i64)
    } else {
        Number::from_f64(number).map_or(Value::Null, Value::Number)
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ScriptConfig {
    values: BTreeMap<String, ConfigValue>,
}

impl ScriptConfig {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<&ConfigValue> {
        self.values.get(name)
    }

    pub fn text(&self, name: &str) -> Option<&str> {
        match self.values.get(name)? {
            ConfigValue::Text(text) => Some(text),
            _ => None,
        }
    }

    pub fn number(&self, name: &str) -> Option<f64> {
        match self.values.get(name)? {
            ConfigValue::Number(number) => Some(*number),
            _ => None,
        }
    }

    pub fn flag(&self, name: &str) -> Option<bool> {
        match self.values.get(name)? {
            ConfigValue::Flag(flag) => Some(*flag),
            _ => None,
        }
    }

    pub fn choice(&self, name: &str) -> Option<(usize, &str)> {
        match self.values.get(name)? {
            ConfigValue::Choice { index, label } => Some((*index, label)),
            _ => None,
        }
    }

    pub fn strings(&self, name: &str) -> Option<&[String]> {
        match self.values.get(name)? {
            ConfigValue::Strings(items) => Some(items),
            _ => None,
        }
    }

    pub fn rows(&self, name: &str) -> Option<&[ScriptConfig]> {
        match self.values.get(name)? {
            ConfigValue::Rows(rows) => Some(rows),
            _ => None,
        }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn to_json(&self) -> Value {
        let map: Map<String, Value> = self
            .values
            .iter()
            .map(|(key, value)| (key.clone(), value.to_json()))
            .collect();
        Value::Object(map)
    }

    /// Decodes the configuration into a script-defined struct.
    pub fn deserialize<T: DeserializeOwned>(&self) -> Result<T, ConfigError> {
        serde_json::from_value(self.to_json()).map_err(|err| ConfigError::Deserialize(err.to_string()))
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConfigSchema {
    vars: Vec<VarDescriptor>,
}

impl ConfigSchema {
    pub fn from_vars(vars: &[VarDescriptor]) -> Self {
        Self {
            vars: vars.to_vec(),
        }
    }

    pub fn vars(&self) -> &[VarDescriptor] {
        &self.vars
    }

    pub fn resolve(&self, raw: &Value) -> Result<ScriptConfig, ConfigError> {
        let empty = Map::new();
        let object = match raw {
            Value::Null => &empty,
            Value::Object(object) => object,
            _ => return Err(ConfigError::NotAnObject),
        };

        let mut config = ScriptConfig::default();
        for var in &self.vars {
            if !conditions_hold(var, &config) {
                continue;
            }
            let stored = object.get(&var.name).filter(|value| !value.is_null());
            let Some(value) = stored.or(var.default.as_ref()) else {
                continue;
            };
            let resolved = resolve_value(var, value)?;
            config.values.insert(var.name.clone(), resolved);
        }
        Ok(config)
    }
}

fn conditions_hold(var: &VarDescriptor, resolved: &ScriptConfig) -> bool {
    var.conditions.iter().all(|condition| {
        resolved
            .get(&condition.field)
            .is_some_and(|value| value.to_json() == condition.value)
    })
}

fn resolve_value(var: &VarDescriptor, value: &Value) -> Result<ConfigValue, ConfigError> {
    let mismatch = || ConfigError::TypeMismatch {
        field: var.name.clone(),
        expected: var.kind.expects(),
    };
    match var.kind {
        VarKind::String | VarKind::Multiline | VarKind::Password => value
            .as_str()
            .map(|text| ConfigValue::Text(text.to_string()))
            .ok_or_else(mismatch),
        VarKind::Channel => match value {
            Value::String(id) => Ok(ConfigValue::Text(id.clone())),
            Value::Number(id) if id.is_i64() || id.is_u64() => Ok(ConfigValue::Text(id.to_string())),
            _ => Err(mismatch()),
        },
        VarKind::Number => match value {
            Value::Number(number) => number.as_f64().map(ConfigValue::Number).ok_or_else(mismatch),
            Value::String(text) => text
                .trim()
                .parse::<f64>()
                .ok()
                .filter(|number| number.is_finite())
                .map(ConfigValue::Number)
                .ok_or_else(mismatch),
            _ => Err(mismatch()),
        },
        VarKind::Checkbox => value.as_bool().map(ConfigValue::Flag).ok_or_else(mismatch),
        VarKind::Select => resolve_choice(var, value),
        VarKind::Strings => {
            let items = value.as_array().ok_or_else(mismatch)?;
            items
                .iter()
                .map(|item| item.as_str().map(str::to_string).ok_or_else(mismatch))
                .collect::<Result<Vec<_>, _>>()
                .map(ConfigValue::Strings)
        }
        VarKind::Array => {
            let rows = value.as_array().ok_or_else(mismatch)?;
            let schema = ConfigSchema::from_vars(&var.vars);
            rows.iter()
                .enumerate()
                .map(|(row, item)| {
                    if !item.is_object() {
                        return Err(mismatch());
                    }
                    schema.resolve(item).map_err(|source| ConfigError::Row {
                        field: var.name.clone(),
                        row,
                        source: Box::new(source),
                    })
                })
                .collect::<Result<Vec<_>, _>>()
                .map(ConfigValue::Rows)
        }
    }
}

fn resolve_choice(var: &VarDescriptor, value: &Value) -> Result<ConfigValue, ConfigError> {
    let index = match value {
        Value::Number(number) => number.as_i64(),
        Value::String(text) => match text.trim().parse::<i64>() {
            Ok(index) => Some(index),
            Err(_) => var
                .options
                .iter()
                .position(|option| option == text)
                .map(|index| index as i64),
        },
        _ => None,
    };
    let index = index.ok_or_else(|| ConfigError::TypeMismatch {
        field: var.name.clone(),
        expected: var.kind.expects(),
    })?;
    let label = usize::try_from(index)
        .ok()
        .and_then(|i| var.options.get(i).map(|label| (i, label)));
    match label {
        Some((index, label)) => Ok(ConfigValue::Choice {
            index,
            label: label.clone(),
        }),
        None => Err(ConfigError::InvalidChoice {
            field: var.name.clone(),
            index,
        }),
    }
}

#[cfg(test)]
mod tests {
    use serde::Deserialize;
    use serde_json::json;

    use super::*;

    fn schema() -> ConfigSchema {
        ConfigSchema::from_vars(&[
            VarDescriptor::new("message", VarKind::String).with_default(json!("hello")),
            VarDescriptor::new("delay", VarKind::Number),
            VarDescriptor::new("enabled", VarKind::Checkbox).with_default(json!(false)),
            VarDescriptor::new("mode", VarKind::Select)
                .with_options(["private", "channel", "server"])
                .with_default(json!(0)),
            VarDescriptor::new("channel", VarKind::Channel)
                .with_condition("mode", json!(1)),
        ])
    }

    #[test]
    fn defaults_fill_missing_values() {
        let config = schema().resolve(&Value::Null).unwrap();
        assert_eq!(config.text("message"), Some("hello"));
        assert_eq!(config.flag("enabled"), Some(false));
        assert_eq!(config.choice("mode"), Some((0, "private")));
        assert_eq!(config.number("delay"), None);
    }

    #[test]
    fn form_strings_are_coerced_for_numbers_and_selects() {
        let config = schema()
            .resolve(&json!({"delay": "2.5", "mode": "2"}))
            .unwrap();
        assert_eq!(config.number("delay"), Some(2.5));
        assert_eq!(config.choice("mode"), Some((2, "server")));
    }

    #[test]
    fn conditions_hide_values_until_satisfied() {
        let hidden = schema().resolve(&json!({"channel": "42"})).unwrap();
        assert_eq!(hidden.text("channel"), None);

        let shown = schema().resolve(&json!({"mode": 1, "channel": 42})).unwrap();
        assert_eq!(shown.text("channel"), Some("42"));
    }

    #[test]
    fn type_mismatch_names_the_field() {
        let err = schema().resolve(&json!({"enabled": "yes"})).unwrap_err();
        assert_eq!(
            err,
            ConfigError::TypeMismatch {
                field: "enabled".into(),
                expected: "a boolean"
            }
        );
        assert_eq!(schema().resolve(&json!([1, 2])), Err(ConfigError::NotAnObject));
    }

    #[test]
    fn out_of_range_choice_is_rejected() {
        let err = schema().resolve(&json!({"mode": 7})).unwrap_err();
        assert_eq!(
            err,
            ConfigError::InvalidChoice {
                field: "mode".into(),
                index: 7
            }
        );
    }

    #[test]
    fn array_rows_resolve_against_nested_schema() {
        let schema = ConfigSchema::from_vars(&[VarDescriptor::new("commands", VarKind::Array)
            .with_rows(vec![
                VarDescriptor::new("trigger", VarKind::String),
                VarDescriptor::new("reply", VarKind::String).with_default(json!("pong")),
            ])]);
        let config = schema
            .resolve(&json!({"commands": [{"trigger": "!ping"}, {"trigger": "!hi", "reply": "hey"}]}))
            .unwrap();
        let rows = config.rows("commands").unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].text("reply"), Some("pong"));
        assert_eq!(rows[1].text("reply"), Some("hey"));

        let err = schema
            .resolve(&json!({"commands": [{"trigger": 5}]}))
            .unwrap_err();
        assert!(matches!(err, ConfigError::Row { row: 0, .. }));
    }

    #[test]
    fn resolved_config_deserializes_into_script_struct() {
        #[derive(Deserialize)]
        struct Settings {
            message: String,
            enabled: bool,
            mode: usize,
        }
        let config = schema()
            .resolve(&json!({"enabled": true, "mode": "channel"}))
            .unwrap();
        let settings: Settings = config.deserialize().unwrap();
        assert_eq!(settings.message, "hello");
        assert!(settings.enabled);
        assert_eq!(settings.mode, 1);
    }

    #[test]
    fn non_finite_numbers_are_rejected() {
        for raw in ["NaN", "inf", "-infinity"] {
            let err = schema().resolve(&json!({"delay": raw})).unwrap_err();
            assert!(
                matches!(err, ConfigError::TypeMismatch { ref field, .. } if field == "delay"),
                "{raw} was accepted"
            );
        }
        let resolved = schema().resolve(&json!({"delay": "2.5"})).unwrap();
        assert_eq!(resolved.to_json()["delay"], json!(2.5));
    }
}
