//! Schema migration for persisted state documents
//!
//! Version history:
//! - 1.0: legacy, no phase_machine_state, verification may lack the
//!   ready_for_completion flag
//! - 2.0: phase_machine_state added, ready_for_completion derived

use serde_yaml::Value;
use tracing::{debug, info};

/// Current schema version written by the store
pub const SCHEMA_VERSION: &str = "2.0";

/// Migrate a raw state document forward to the current schema.
///
/// Migration only ever adds fields; nothing is discarded. Returns true if
/// the document changed and should be re-saved.
pub fn migrate_state_doc(doc: &mut Value) -> bool {
    let Some(map) = doc.as_mapping_mut() else {
        return false;
    };

    let version = map
        .get("schema_version")
        .and_then(|v| v.as_str())
        .unwrap_or("1.0")
        .to_string();

    let mut migrated = false;

    // 1.0 -> 2.0: add phase_machine_state and ready_for_completion
    if version == "1.0" {
        debug!("migrating state document 1.0 -> 2.0");
        if !map.contains_key("phase_machine_state") {
            map.insert(Value::from("phase_machine_state"), Value::Mapping(Default::default()));
        }

        let verification = map
            .entry(Value::from("verification"))
            .or_insert_with(|| Value::Mapping(Default::default()));
        if let Some(vmap) = verification.as_mapping_mut()
            && !vmap.contains_key("ready_for_completion")
        {
            vmap.insert(Value::from("ready_for_completion"), Value::Bool(false));
        }

        map.insert(Value::from("schema_version"), Value::from(SCHEMA_VERSION));
        migrated = true;
        info!("state document migrated to schema {}", SCHEMA_VERSION);
    }

    // Future migrations chain here (2.0 -> 3.0, ...)

    migrated
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_migrate_from_1_0() {
        let mut doc: Value = serde_yaml::from_str(
            "schema_version: '1.0'\nphase: init\ncurrent_step: 2\nverification:\n  checks_failing: 1\n",
        )
        .unwrap();

        let migrated = migrate_state_doc(&mut doc);
        assert!(migrated);

        let map = doc.as_mapping().unwrap();
        assert_eq!(map.get("schema_version").unwrap().as_str().unwrap(), SCHEMA_VERSION);
        assert!(map.contains_key("phase_machine_state"));
        let verification = map.get("verification").unwrap().as_mapping().unwrap();
        assert_eq!(verification.get("ready_for_completion"), Some(&Value::Bool(false)));
        // Existing fields untouched
        assert_eq!(verification.get("checks_failing"), Some(&Value::from(1)));
    }

    #[test]
    fn test_migrate_missing_version_treated_as_1_0() {
        let mut doc: Value = serde_yaml::from_str("phase: init\ncurrent_step: 0\n").unwrap();
        assert!(migrate_state_doc(&mut doc));
        assert!(doc.as_mapping().unwrap().contains_key("phase_machine_state"));
    }

    #[test]
    fn test_migrate_current_version_is_noop() {
        let raw = format!("schema_version: '{}'\nphase: verify\ncurrent_step: 4\n", SCHEMA_VERSION);
        let mut doc: Value = serde_yaml::from_str(&raw).unwrap();
        let before = doc.clone();
        assert!(!migrate_state_doc(&mut doc));
        assert_eq!(doc, before);
    }
}
