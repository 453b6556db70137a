pub mod capability;
pub mod config;
pub mod error;
pub mod manifest;
pub mod vars;

pub use capability::CapabilityName;
pub use config::{ConfigSchema, ConfigValue, ScriptConfig};
pub use error::{CapabilityDenied, ConfigError, ManifestError, OperationError, OperationErrorKind};
pub use manifest::{BackendKind, Manifest};
pub use vars::{VarDescriptor, VarKind};

/// Version of the scripting API this SDK describes.
pub const API_VERSION: &str = env!("CARGO_PKG_VERSION");
