//! Package identifiers.

use serde::{Deserialize, Serialize};

/// Identifier carried by every package.
///
/// Randomly generated and not guaranteed unique; only used to correlate log
/// lines for one package across retries.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PackageId(pub u32);

impl PackageId {
    pub fn random() -> Self {
        Self(rand::random())
    }
}

impl Default for PackageId {
    fn default() -> Self {
        Self::random()
    }
}

impl std::fmt::Display for PackageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}
