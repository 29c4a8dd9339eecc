use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Kind of execution context hosting the worker. Decides the mount backend.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HostEnvironment {
    /// Server-like context with direct access to the host filesystem
    #[default]
    Native,
    /// Browser-like context, only a persistent key/value store is available
    Browser,
}

impl HostEnvironment {
    pub fn is_native(self) -> bool {
        self == HostEnvironment::Native
    }
}

impl fmt::Display for HostEnvironment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HostEnvironment::Native => f.write_str("native"),
            HostEnvironment::Browser => f.write_str("browser"),
        }
    }
}

impl FromStr for HostEnvironment {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "native" | "node" => Ok(HostEnvironment::Native),
            "browser" | "web" => Ok(HostEnvironment::Browser),
            other => anyhow::bail!("unknown host environment '{}' (expected native or browser)", other),
        }
    }
}
