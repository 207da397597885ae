// protocol/version.rs - Protocol version negotiation

use serde::{Deserialize, Serialize};

/// Current protocol version spoken by this build.
pub const PROTOCOL_VERSION: u32 = 1;

/// Oldest client protocol version the server still accepts.
pub const PROTOCOL_VERSION_MIN: u32 = 1;

/// The version window the server advertises on `/v1/version`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionInfo {
    pub current: u32,
    pub min_supported: u32,
}

impl VersionInfo {
    pub fn advertised() -> Self {
        Self {
            current: PROTOCOL_VERSION,
            min_supported: PROTOCOL_VERSION_MIN,
        }
    }

    /// A client version is compatible iff it falls inside the window.
    pub fn is_compatible(&self, client_version: u32) -> bool {
        self.min_supported <= client_version && client_version <= self.current
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn window_bounds_are_inclusive() {
        let info = VersionInfo {
            current: 3,
            min_supported: 2,
        };
        assert!(!info.is_compatible(1));
        assert!(info.is_compatible(2));
        assert!(info.is_compatible(3));
        assert!(!info.is_compatible(4));
    }

    #[test]
    fn advertised_window_accepts_current() {
        assert!(VersionInfo::advertised().is_compatible(PROTOCOL_VERSION));
    }
}
