//! CDI device specification handling.
//!
//! The specification file is the single piece of configuration this plugin
//! consumes: it names a vendor, a device class and the devices to expose.
//! Only the fields the plugin acts on are modeled; container edits and other
//! CDI payload are left to the runtime that resolves the references we hand
//! out.

use std::collections::HashSet;
use std::path::Path;

use error_stack::Report;
use error_stack::ResultExt;
use serde::Deserialize;
use serde::Serialize;
use thiserror::Error;

/// Errors raised while loading or validating a CDI specification.
#[derive(Debug, Error)]
pub enum SpecError {
    #[error("Failed to read CDI spec file: {path}")]
    ReadFailed { path: String },
    #[error("Failed to parse CDI spec document: {path}")]
    ParseFailed { path: String },
    #[error("Invalid CDI kind {kind:?}, expected \"vendor/class\"")]
    InvalidKind { kind: String },
    #[error("Invalid device name {name:?}")]
    InvalidDeviceName { name: String },
    #[error("Duplicate device name {name:?}")]
    DuplicateDevice { name: String },
}

/// One named device in the specification.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CdiDeviceEntry {
    pub name: String,
}

/// The subset of a CDI specification this plugin consumes.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CdiSpec {
    #[serde(default)]
    pub cdi_version: String,
    /// Qualifier shared by every device in the spec, `vendor/class`.
    pub kind: String,
    #[serde(default)]
    pub devices: Vec<CdiDeviceEntry>,
}

impl CdiSpec {
    /// Load and validate a specification from a JSON or YAML file. The
    /// format is picked from the file extension, defaulting to JSON.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, Report<SpecError>> {
        let path = path.as_ref();
        let content =
            std::fs::read_to_string(path).change_context_lazy(|| SpecError::ReadFailed {
                path: path.display().to_string(),
            })?;

        let spec: Self = match path.extension().and_then(|ext| ext.to_str()) {
            Some("yaml") | Some("yml") => serde_yaml::from_str(&content).change_context_lazy(
                || SpecError::ParseFailed {
                    path: path.display().to_string(),
                },
            )?,
            _ => serde_json::from_str(&content).change_context_lazy(|| SpecError::ParseFailed {
                path: path.display().to_string(),
            })?,
        };

        spec.validate()?;
        Ok(spec)
    }

    /// Vendor half of the kind, e.g. `vendor.example`. Empty if the kind
    /// never passed validation.
    pub fn vendor(&self) -> &str {
        self.kind_parts().map(|(vendor, _)| vendor).unwrap_or_default()
    }

    /// Class half of the kind, e.g. `gpu`. Empty if the kind never passed
    /// validation.
    pub fn class(&self) -> &str {
        self.kind_parts().map(|(_, class)| class).unwrap_or_default()
    }

    fn kind_parts(&self) -> Option<(&str, &str)> {
        let (vendor, class) = self.kind.split_once('/')?;
        if vendor.is_empty() || class.is_empty() || class.contains('/') {
            return None;
        }
        Some((vendor, class))
    }

    fn validate(&self) -> Result<(), Report<SpecError>> {
        if self.kind_parts().is_none() {
            return Err(Report::new(SpecError::InvalidKind {
                kind: self.kind.clone(),
            }));
        }

        let mut seen = HashSet::new();
        for device in &self.devices {
            if device.name.is_empty() {
                return Err(Report::new(SpecError::InvalidDeviceName {
                    name: device.name.clone(),
                }));
            }
            if !seen.insert(device.name.as_str()) {
                return Err(Report::new(SpecError::DuplicateDevice {
                    name: device.name.clone(),
                }));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    fn write_spec(content: &str, suffix: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::Builder::new()
            .suffix(suffix)
            .tempfile()
            .expect("should create temp spec file");
        file.write_all(content.as_bytes())
            .expect("should write temp spec file");
        file
    }

    #[test]
    fn test_parse_json_spec() {
        let file = write_spec(
            r#"{
                "cdiVersion": "0.6.0",
                "kind": "acme/gpu",
                "devices": [{"name": "dev0"}, {"name": "dev1"}]
            }"#,
            ".json",
        );

        let spec = CdiSpec::from_file(file.path()).expect("should parse a valid JSON spec");
        assert_eq!(spec.vendor(), "acme", "vendor should come from the kind");
        assert_eq!(spec.class(), "gpu", "class should come from the kind");
        assert_eq!(
            spec.devices.len(),
            2,
            "all declared devices should be retained"
        );
        assert_eq!(spec.devices[0].name, "dev0");
    }

    #[test]
    fn test_parse_yaml_spec() {
        let file = write_spec(
            "cdiVersion: \"0.6.0\"\nkind: vendor.example/accel\ndevices:\n  - name: card0\n",
            ".yaml",
        );

        let spec = CdiSpec::from_file(file.path()).expect("should parse a valid YAML spec");
        assert_eq!(spec.vendor(), "vendor.example");
        assert_eq!(spec.class(), "accel");
        assert_eq!(spec.devices.len(), 1);
    }

    #[test]
    fn test_unknown_fields_are_ignored() {
        let file = write_spec(
            r#"{
                "cdiVersion": "0.6.0",
                "kind": "acme/gpu",
                "devices": [{"name": "dev0", "containerEdits": {"env": ["X=1"]}}],
                "containerEdits": {}
            }"#,
            ".json",
        );

        let spec =
            CdiSpec::from_file(file.path()).expect("extra CDI payload should not break parsing");
        assert_eq!(spec.devices[0].name, "dev0");
    }

    #[test]
    fn test_empty_device_list_is_valid() {
        let file = write_spec(r#"{"kind": "acme/gpu", "devices": []}"#, ".json");

        let spec = CdiSpec::from_file(file.path()).expect("a spec without devices is valid");
        assert!(spec.devices.is_empty());
    }

    #[test]
    fn test_missing_file_is_read_error() {
        let err = CdiSpec::from_file("/nonexistent/spec.json")
            .expect_err("a missing file should be an error");
        assert!(
            matches!(err.current_context(), SpecError::ReadFailed { .. }),
            "expected ReadFailed, got {err:?}"
        );
    }

    #[test]
    fn test_malformed_document_is_parse_error() {
        let file = write_spec("{not json", ".json");

        let err =
            CdiSpec::from_file(file.path()).expect_err("a malformed document should be an error");
        assert!(
            matches!(err.current_context(), SpecError::ParseFailed { .. }),
            "expected ParseFailed, got {err:?}"
        );
    }

    #[test]
    fn test_kind_without_separator_is_rejected() {
        let file = write_spec(r#"{"kind": "acmegpu", "devices": []}"#, ".json");

        let err = CdiSpec::from_file(file.path())
            .expect_err("a kind without vendor/class split should be rejected");
        assert!(matches!(
            err.current_context(),
            SpecError::InvalidKind { .. }
        ));
    }

    #[test]
    fn test_kind_with_empty_halves_is_rejected() {
        for kind in ["/gpu", "acme/", "/"] {
            let file = write_spec(&format!(r#"{{"kind": "{kind}", "devices": []}}"#), ".json");
            let err = CdiSpec::from_file(file.path())
                .expect_err("a kind with an empty vendor or class should be rejected");
            assert!(
                matches!(err.current_context(), SpecError::InvalidKind { .. }),
                "expected InvalidKind for {kind:?}, got {err:?}"
            );
        }
    }

    #[test]
    fn test_duplicate_device_names_are_rejected() {
        let file = write_spec(
            r#"{"kind": "acme/gpu", "devices": [{"name": "dev0"}, {"name": "dev0"}]}"#,
            ".json",
        );

        let err = CdiSpec::from_file(file.path())
            .expect_err("duplicate device names should be rejected");
        assert!(matches!(
            err.current_context(),
            SpecError::DuplicateDevice { .. }
        ));
    }

    #[test]
    fn test_empty_device_name_is_rejected() {
        let file = write_spec(r#"{"kind": "acme/gpu", "devices": [{"name": ""}]}"#, ".json");

        let err =
            CdiSpec::from_file(file.path()).expect_err("an empty device name should be rejected");
        assert!(matches!(
            err.current_context(),
            SpecError::InvalidDeviceName { .. }
        ));
    }
}
