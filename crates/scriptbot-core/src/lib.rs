//! Host runtime for manifest-described chat bot scripts.

pub mod capabilities;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod host;
pub mod plugin;
pub mod registry;

pub use config::HostConfig;
pub use dispatch::EventHub;
pub use error::{HostError, RequireError};
pub use host::{HostBuilder, InboundEvent, Rejection, ScriptHost, ScriptSummary};
pub use plugin::{PluginState, ScriptContext, ScriptId, ScriptMain};
pub use registry::{Binding, Capability, CapabilityHandle, CapabilityRegistry, Grants};

/// Returns the crate version baked in at compile time.
pub const fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
