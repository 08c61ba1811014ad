//! Capability categories a plugin may be granted.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// A named category of host-mediated operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Capability {
    Storage,
    Logger,
    Ui,
    Chat,
    Network,
}

impl Capability {
    pub const ALL: [Capability; 5] = [
        Self::Storage,
        Self::Logger,
        Self::Ui,
        Self::Chat,
        Self::Network,
    ];

    /// The method-name prefix this capability gates (`storage` in `storage.get`).
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Storage => "storage",
            Self::Logger => "logger",
            Self::Ui => "ui",
            Self::Chat => "chat",
            Self::Network => "network",
        }
    }

    /// The capability a dotted method name belongs to.
    pub fn of_method(method: &str) -> Option<Self> {
        let (prefix, _) = method.split_once('.')?;
        prefix.parse().ok()
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Capability {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|c| c.as_str() == s)
            .ok_or_else(|| format!("unknown capability '{s}'"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_roundtrip() {
        for cap in Capability::ALL {
            assert_eq!(cap.as_str().parse::<Capability>().unwrap(), cap);
        }
        assert!("filesystem".parse::<Capability>().is_err());
    }

    #[test]
    fn method_prefix() {
        assert_eq!(Capability::of_method("storage.get"), Some(Capability::Storage));
        assert_eq!(Capability::of_method("network.fetch"), Some(Capability::Network));
        assert_eq!(Capability::of_method("process.spawn"), None);
        assert_eq!(Capability::of_method("storage"), None);
    }

    #[test]
    fn serde_is_lowercase() {
        assert_eq!(serde_json::to_string(&Capability::Ui).unwrap(), "\"ui\"");
    }
}
