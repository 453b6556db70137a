use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Every module name a script may pass to `require`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CapabilityName {
    Audio,
    Backend,
    Crypto,
    Db,
    DiscordDangerous,
    Engine,
    Event,
    Format,
    Fs,
    Graphics,
    Helpers,
    Http,
    Media,
    Net,
    Store,
    Ws,
}

impl CapabilityName {
    pub const ALL: [CapabilityName; 16] = [
        CapabilityName::Audio,
        CapabilityName::Backend,
        CapabilityName::Crypto,
        CapabilityName::Db,
        CapabilityName::DiscordDangerous,
        CapabilityName::Engine,
        CapabilityName::Event,
        CapabilityName::Format,
        CapabilityName::Fs,
        CapabilityName::Graphics,
        CapabilityName::Helpers,
        CapabilityName::Http,
        CapabilityName::Media,
        CapabilityName::Net,
        CapabilityName::Store,
        CapabilityName::Ws,
    ];

    pub const fn as_str(self) -> &'static str {
        match self {
            CapabilityName::Audio => "audio",
            CapabilityName::Backend => "backend",
            CapabilityName::Crypto => "crypto",
            CapabilityName::Db => "db",
            CapabilityName::DiscordDangerous => "discord-dangerous",
            CapabilityName::Engine => "engine",
            CapabilityName::Event => "event",
            CapabilityName::Format => "format",
            CapabilityName::Fs => "fs",
            CapabilityName::Graphics => "graphics",
            CapabilityName::Helpers => "helpers",
            CapabilityName::Http => "http",
            CapabilityName::Media => "media",
            CapabilityName::Net => "net",
            CapabilityName::Store => "store",
            CapabilityName::Ws => "ws",
        }
    }

    /// Protected modules are only handed out when listed in the manifest's
    /// `requiredModules`.
    pub const fn is_protected(self) -> bool {
        matches!(
            self,
            CapabilityName::Db
                | CapabilityName::Http
                | CapabilityName::Net
                | CapabilityName::Ws
                | CapabilityName::Fs
                | CapabilityName::Graphics
                | CapabilityName::Crypto
                | CapabilityName::DiscordDangerous
        )
    }
}

impl fmt::Display for CapabilityName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown module `{0}`")]
pub struct UnknownCapability(pub String);

impl FromStr for CapabilityName {
    type Err = UnknownCapability;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        CapabilityName::ALL
            .into_iter()
            .find(|name| name.as_str() == s)
            .ok_or_else(|| UnknownCapability(s.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_parse_back_to_themselves() {
        for name in CapabilityName::ALL {
            assert_eq!(name.as_str().parse::<CapabilityName>(), Ok(name));
        }
        let err = "sql".parse::<CapabilityName>().unwrap_err();
        assert_eq!(err.to_string(), "unknown module `sql`");
    }

    #[test]
    fn protected_partition_matches_module_docs() {
        let protected: Vec<_> = CapabilityName::ALL
            .into_iter()
            .filter(|name| name.is_protected())
            .map(CapabilityName::as_str)
            .collect();
        assert_eq!(
            protected,
            ["crypto", "db", "discord-dangerous", "fs", "graphics", "http", "net", "ws"]
        );
    }

    #[test]
    fn serde_uses_kebab_case() {
        let json = serde_json::to_string(&CapabilityName::DiscordDangerous).unwrap();
        assert_eq!(json, "\"discord-dangerous\"");
    }
}
