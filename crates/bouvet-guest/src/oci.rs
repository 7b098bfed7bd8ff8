//! The slice of the OCI runtime spec that device handlers touch.

use serde::{Deserialize, Serialize};

/// Container runtime spec, as far as device attachment is concerned.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Spec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub linux: Option<Linux>,
}

/// Linux-specific section.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Linux {
    #[serde(default)]
    pub devices: Vec<LinuxDevice>,
}

/// A device node to be created inside the container.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LinuxDevice {
    /// Path inside the container.
    pub path: String,
    /// Device type (`b`, `c`, `u` or `p`).
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default)]
    pub major: i64,
    #[serde(default)]
    pub minor: i64,
    #[serde(rename = "fileMode", default, skip_serializing_if = "Option::is_none")]
    pub file_mode: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uid: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gid: Option<u32>,
}

impl Spec {
    /// Spec with a `linux` section holding `devices`.
    pub fn with_devices(devices: Vec<LinuxDevice>) -> Self {
        Self {
            linux: Some(Linux { devices }),
        }
    }
}
