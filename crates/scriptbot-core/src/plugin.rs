use std::{fmt, sync::Arc};

use scriptbot_plugin_sdk::{Manifest, ScriptConfig};

use crate::{
    error::RequireError,
    registry::{Capability, CapabilityHandle, Grants},
};

/// Handle the host assigns to a registered script.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ScriptId(pub(crate) usize);

impl fmt::Display for ScriptId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Lifecycle of a registered script. `Rejected` and `Failed` are terminal
/// states for scripts that never reached (or fell out of) `Running`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PluginState {
    Validated,
    Loaded,
    Running,
    Reloaded,
    Unloaded,
    Rejected,
    Failed,
}

impl PluginState {
    /// Running scripts receive events and completions.
    pub fn is_live(self) -> bool {
        matches!(self, PluginState::Running | PluginState::Reloaded)
    }
}

impl fmt::Display for PluginState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            PluginState::Validated => "validated",
            PluginState::Loaded => "loaded",
            PluginState::Running => "running",
            PluginState::Reloaded => "reloaded",
            PluginState::Unloaded => "unloaded",
            PluginState::Rejected => "rejected",
            PluginState::Failed => "failed",
        };
        f.write_str(label)
    }
}

/// Entry point of a script, invoked when the host starts or reloads it.
///
/// The first argument takes the place of the deprecated placeholder that
/// scripts used to ignore; it carries the script's context instead.
pub trait ScriptMain: Send + 'static {
    fn main(
        &mut self,
        cx: &mut ScriptContext,
        config: &ScriptConfig,
        manifest: &Manifest,
    ) -> anyhow::Result<()>;
}

impl<F> ScriptMain for F
where
    F: FnMut(&mut ScriptContext, &ScriptConfig, &Manifest) -> anyhow::Result<()> + Send + 'static,
{
    fn main(
        &mut self,
        cx: &mut ScriptContext,
        config: &ScriptConfig,
        manifest: &Manifest,
    ) -> anyhow::Result<()> {
        self(cx, config, manifest)
    }
}

/// What a running script sees of the host: its identity and the modules it
/// was granted at load time.
pub struct ScriptContext {
    id: ScriptId,
    manifest: Arc<Manifest>,
    grants: Arc<Grants>,
}

impl ScriptContext {
    pub(crate) fn new(id: ScriptId, manifest: Arc<Manifest>, grants: Arc<Grants>) -> Self {
        Self {
            id,
            manifest,
            grants,
        }
    }

    pub fn id(&self) -> ScriptId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.manifest.name
    }

    pub fn manifest(&self) -> &Manifest {
        &self.manifest
    }

    /// Typed module lookup, e.g. `cx.require::<Http>()`.
    pub fn require<C: Capability>(&self) -> Result<Arc<C::Namespace>, RequireError> {
        self.grants.require::<C>()
    }

    /// Module lookup by its script-facing name, e.g. `"http"`.
    pub fn require_named(&self, name: &str) -> Result<CapabilityHandle, RequireError> {
        self.grants.require_named(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_running_states_are_live() {
        assert!(PluginState::Running.is_live());
        assert!(PluginState::Reloaded.is_live());
        for state in [
            PluginState::Validated,
            PluginState::Loaded,
            PluginState::Unloaded,
            PluginState::Rejected,
            PluginState::Failed,
        ] {
            assert!(!state.is_live(), "{state} should not be live");
        }
    }

    #[test]
    fn script_ids_display_with_hash() {
        assert_eq!(ScriptId(3).to_string(), "#3");
    }
}
