use scriptbot_plugin_sdk::{CapabilityDenied, CapabilityName, ConfigError, ManifestError};
use thiserror::Error;

use crate::plugin::{PluginState, ScriptId};

/// Load-time and lifecycle failures. Each one is fatal to the affected script
/// only; the host and every other script keep running.
#[derive(Debug, Error)]
pub enum HostError {
    #[error(transparent)]
    Manifest(#[from] ManifestError),

    #[error("script `{script}` requires engine `{required}` but this host is {host}")]
    EngineUnsatisfied {
        script: String,
        required: String,
        host: String,
    },

    #[error("script `{script}` declares invalid engine range `{range}`: {reason}")]
    InvalidEngineRange {
        script: String,
        range: String,
        reason: String,
    },

    #[error("script `{script}` does not support the `{backend}` backend")]
    UnsupportedBackend { script: String, backend: String },

    #[error("script `{script}` requires module `{module}` which this host does not provide")]
    UnknownModule { script: String, module: String },

    #[error("no script with id {0}")]
    UnknownScript(ScriptId),

    #[error("script `{script}` cannot move from {from} to {to}")]
    InvalidTransition {
        script: String,
        from: PluginState,
        to: PluginState,
    },

    #[error("configuration of script `{script}` is invalid: {source}")]
    Config {
        script: String,
        #[source]
        source: ConfigError,
    },

    #[error("script `{script}` failed while starting: {reason}")]
    StartFailed { script: String, reason: String },
}

/// Why a `require` call did not yield a namespace.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RequireError {
    #[error(transparent)]
    Denied(#[from] CapabilityDenied),

    #[error("unknown module `{0}`")]
    Unknown(String),

    #[error("module `{0}` is not available on this host")]
    Unavailable(CapabilityName),
}
