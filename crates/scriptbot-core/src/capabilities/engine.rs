use std::{
    collections::HashMap,
    fmt,
    sync::{
        atomic::{AtomicU8, Ordering},
        Arc,
    },
};

use parking_lot::RwLock;
use scriptbot_plugin_sdk::{BackendKind, ConfigSchema, OperationError, OperationErrorKind};
use serde_json::Value;

use super::backend::ChatBackend;
use crate::dispatch::Outbox;

/// Highest log level the web interface exposes.
pub const MAX_LOG_LEVEL: u8 = 11;

/// Stored configuration per script name. Seeded from the host config and
/// updated by `engine.save_config`; read on every start and reload.
#[derive(Clone, Default)]
pub struct ConfigStore {
    inner: Arc<RwLock<HashMap<String, Value>>>,
}

impl ConfigStore {
    pub fn new(initial: HashMap<String, Value>) -> Self {
        Self {
            inner: Arc::new(RwLock::new(initial)),
        }
    }

    pub fn get(&self, script: &str) -> Value {
        self.inner.read().get(script).cloned().unwrap_or(Value::Null)
    }

    pub fn set(&self, script: &str, value: Value) {
        self.inner.write().insert(script.to_string(), value);
    }
}

/// Instance-wide values every engine namespace reads and writes.
pub(crate) struct EngineShared {
    pub(crate) instance_id: String,
    pub(crate) bot_id: String,
    pub(crate) allow_reload: bool,
    pub(crate) instance_log_level: AtomicU8,
    pub(crate) bot_log_level: AtomicU8,
    pub(crate) configs: ConfigStore,
    pub(crate) backend: Arc<dyn ChatBackend>,
}

/// The `engine` module.
pub struct EngineNamespace {
    script: String,
    hidden: bool,
    schema: ConfigSchema,
    shared: Arc<EngineShared>,
    outbox: Outbox,
}

impl EngineNamespace {
    pub(crate) fn new(
        script: String,
        hidden: bool,
        schema: ConfigSchema,
        shared: Arc<EngineShared>,
        outbox: Outbox,
    ) -> Self {
        Self {
            script,
            hidden,
            schema,
            shared,
            outbox,
        }
    }

    pub fn instance_id(&self) -> &str {
        &self.shared.instance_id
    }

    pub fn bot_id(&self) -> &str {
        &self.shared.bot_id
    }

    pub fn backend(&self) -> BackendKind {
        self.shared.backend.kind()
    }

    /// Writes a line to the instance log, tagged with the script name.
    pub fn log(&self, message: impl fmt::Display) {
        tracing::info!(target: "scriptbot::script", script = %self.script, "{message}");
    }

    /// Raises a notification on the web interface.
    pub fn notify(&self, message: impl fmt::Display) {
        tracing::warn!(target: "scriptbot::notify", script = %self.script, "{message}");
    }

    pub fn instance_log_level(&self) -> u8 {
        self.shared.instance_log_level.load(Ordering::Relaxed)
    }

    /// Returns false and leaves the level alone when `level` is out of range.
    pub fn set_instance_log_level(&self, level: u8) -> bool {
        set_level(&self.shared.instance_log_level, level)
    }

    pub fn bot_log_level(&self) -> u8 {
        self.shared.bot_log_level.load(Ordering::Relaxed)
    }

    pub fn set_bot_log_level(&self, level: u8) -> bool {
        set_level(&self.shared.bot_log_level, level)
    }

    pub fn nick(&self) -> String {
        self.shared.backend.nick()
    }

    pub fn set_nick(&self, nick: &str) -> bool {
        self.shared.backend.set_nick(nick)
    }

    pub fn is_running(&self) -> bool {
        self.shared.backend.is_connected()
    }

    /// Checks `config` against the script's vars and stores it for the next
    /// start or reload. The running script keeps its current configuration.
    pub fn save_config(&self, config: Value) -> Result<(), OperationError> {
        if self.hidden {
            return Err(OperationError::new(
                OperationErrorKind::Denied,
                "hidden scripts have no configuration",
            ));
        }
        let resolved = self
            .schema
            .resolve(&config)
            .map_err(|err| OperationError::new(OperationErrorKind::InvalidRequest, err.to_string()))?;
        self.shared.configs.set(&self.script, resolved.to_json());
        tracing::debug!(script = %self.script, "configuration saved");
        Ok(())
    }

    /// Asks the host to reload every running script. Only honoured when the
    /// host allows it.
    pub fn reload_scripts(&self) -> bool {
        if !self.shared.allow_reload {
            return false;
        }
        self.outbox.request_reload();
        true
    }
}

fn set_level(slot: &AtomicU8, level: u8) -> bool {
    if level > MAX_LOG_LEVEL {
        return false;
    }
    slot.store(level, Ordering::Relaxed);
    true
}
