//! Artifact header model.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Contents of the `version` file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FormatVersion {
    pub format: String,
    pub version: u32,
}

/// Contents of the `header-info` file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeaderInfo {
    #[serde(default)]
    pub payloads: Vec<PayloadInfo>,
    #[serde(default)]
    pub artifact_provides: ArtifactProvides,
    #[serde(default)]
    pub artifact_depends: ArtifactDepends,
}

/// Entry of the payload list in `header-info`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PayloadInfo {
    /// Payload type, `null` for payloads carrying no data.
    #[serde(rename = "type")]
    pub payload_type: Option<String>,
}

/// What installing the artifact provides.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactProvides {
    #[serde(default)]
    pub artifact_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact_group: Option<String>,
}

/// What installing the artifact requires.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactDepends {
    #[serde(default)]
    pub device_type: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub artifact_name: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub artifact_group: Vec<String>,
}

/// Contents of a payload's `type-info` file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TypeInfo {
    #[serde(rename = "type")]
    pub payload_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact_provides: Option<serde_json::Map<String, Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact_depends: Option<serde_json::Map<String, Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub clears_artifact_provides: Option<Vec<String>>,
}

impl TypeInfo {
    /// Check whether the payload declares provides or depends.
    pub fn has_constraints(&self) -> bool {
        self.artifact_provides.as_ref().is_some_and(|map| !map.is_empty())
            || self.artifact_depends.as_ref().is_some_and(|map| !map.is_empty())
    }
}

/// Headers of a single payload.
#[derive(Debug, Clone)]
pub struct PayloadHeader {
    /// Position of the payload in the artifact.
    pub index: usize,
    pub payload_type: String,
    pub type_info: TypeInfo,
    /// Verbatim `type-info` document.
    pub type_info_json: Value,
    /// Verbatim `meta-data` document, `null` if absent.
    pub meta_data: Value,
}

/// Headers of an artifact.
#[derive(Debug, Clone)]
pub struct ArtifactHeaders {
    /// Format version.
    pub version: u32,
    pub info: HeaderInfo,
    /// Verbatim `header-info` document.
    pub info_json: Value,
    /// Names of the state scripts in the artifact.
    pub scripts: Vec<String>,
    pub payloads: Vec<PayloadHeader>,
    /// Whether the manifest signature has been verified.
    pub signed: bool,
}

impl ArtifactHeaders {
    pub fn artifact_name(&self) -> &str {
        &self.info.artifact_provides.artifact_name
    }

    pub fn artifact_group(&self) -> Option<&str> {
        self.info.artifact_provides.artifact_group.as_deref()
    }

    /// Device types the artifact is compatible with.
    pub fn compatible_devices(&self) -> &[String] {
        &self.info.artifact_depends.device_type
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_header_info() {
        let info: HeaderInfo = serde_json::from_str(
            r#"{
                "payloads": [{"type": "rootfs-image"}, {"type": null}],
                "artifact_provides": {"artifact_name": "release-1"},
                "artifact_depends": {"device_type": ["rpi4", "rpi5"]}
            }"#,
        )
        .unwrap();
        assert_eq!(info.payloads[0].payload_type.as_deref(), Some("rootfs-image"));
        assert_eq!(info.payloads[1].payload_type, None);
        assert_eq!(info.artifact_provides.artifact_name, "release-1");
        assert_eq!(info.artifact_provides.artifact_group, None);
        assert_eq!(info.artifact_depends.device_type, ["rpi4", "rpi5"]);
    }

    #[test]
    fn test_type_info_constraints() {
        let info: TypeInfo = serde_json::from_str(r#"{"type": "rootfs-image"}"#).unwrap();
        assert!(!info.has_constraints());
        let info: TypeInfo = serde_json::from_str(
            r#"{"type": "rootfs-image", "artifact_provides": {}, "artifact_depends": {}}"#,
        )
        .unwrap();
        assert!(!info.has_constraints());
        let info: TypeInfo = serde_json::from_str(
            r#"{"type": "file", "artifact_depends": {"rootfs-image.checksum": "abc"}}"#,
        )
        .unwrap();
        assert!(info.has_constraints());
    }
}
