use std::fmt;

use thiserror::Error;

use crate::capability::CapabilityName;

/// Structural problems with a plugin manifest. A plugin whose manifest fails
/// validation is never loaded.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ManifestError {
    #[error("manifest is missing required field `{0}`")]
    MissingField(&'static str),

    #[error("manifest could not be parsed: {0}")]
    Parse(String),

    #[error("hidden scripts cannot declare vars")]
    HiddenWithVars,

    #[error("variable `{0}` is declared more than once")]
    DuplicateVar(String),

    #[error("variable `{name}` is invalid: {reason}")]
    InvalidVar { name: String, reason: String },

    #[error("a script named `{0}` is already registered")]
    Duplicate(String),
}

/// A protected capability was requested without being declared in
/// `requiredModules`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("module `{capability}` is protected and must be listed in requiredModules of `{script}`")]
pub struct CapabilityDenied {
    pub capability: CapabilityName,
    pub script: String,
}

/// Reasons a stored configuration does not fit the schema derived from a
/// manifest's `vars`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("configuration must be a JSON object")]
    NotAnObject,

    #[error("`{field}` must be {expected}")]
    TypeMismatch { field: String, expected: &'static str },

    #[error("`{field}` has no option with index {index}")]
    InvalidChoice { field: String, index: i64 },

    #[error("row {row} of `{field}`: {source}")]
    Row {
        field: String,
        row: usize,
        #[source]
        source: Box<ConfigError>,
    },

    #[error("configuration does not match the requested type: {0}")]
    Deserialize(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationErrorKind {
    Timeout,
    Connection,
    InvalidRequest,
    Io,
    Denied,
    NotFound,
    Crypto,
    Encoding,
}

impl fmt::Display for OperationErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            OperationErrorKind::Timeout => "timeout",
            OperationErrorKind::Connection => "connection",
            OperationErrorKind::InvalidRequest => "invalid request",
            OperationErrorKind::Io => "io",
            OperationErrorKind::Denied => "denied",
            OperationErrorKind::NotFound => "not found",
            OperationErrorKind::Crypto => "crypto",
            OperationErrorKind::Encoding => "encoding",
        };
        f.write_str(label)
    }
}

/// Failure inside a capability call (request failed, file missing, ...).
///
/// Asynchronous operations hand this to their completion callback as the
/// `Err` side of a `Result`, so a callback never sees both an error and a
/// result.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{kind} error: {message}")]
pub struct OperationError {
    pub kind: OperationErrorKind,
    pub message: String,
}

impl OperationError {
    pub fn new(kind: OperationErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn io(err: &std::io::Error) -> Self {
        let kind = match err.kind() {
            std::io::ErrorKind::NotFound => OperationErrorKind::NotFound,
            std::io::ErrorKind::PermissionDenied => OperationErrorKind::Denied,
            _ => OperationErrorKind::Io,
        };
        Self::new(kind, err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn denied_names_capability_and_script() {
        let err = CapabilityDenied {
            capability: CapabilityName::Http,
            script: "weather".into(),
        };
        assert_eq!(
            err.to_string(),
            "module `http` is protected and must be listed in requiredModules of `weather`"
        );
    }

    #[test]
    fn io_errors_map_to_operation_kinds() {
        let missing = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        assert_eq!(OperationError::io(&missing).kind, OperationErrorKind::NotFound);
        let other = std::io::Error::new(std::io::ErrorKind::Other, "boom");
        let err = OperationError::io(&other);
        assert_eq!(err.kind, OperationErrorKind::Io);
        assert_eq!(err.to_string(), "io error: boom");
    }
}
