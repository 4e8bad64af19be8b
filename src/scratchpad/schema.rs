//! Schema versioning and validation for structured sections.
//!
//! Every structured (YAML/JSON) section carries a top-level
//! `schema_version`. On read, a value at an older version is migrated
//! through chained one-step migrators before deserialization; a version
//! with no path to the current one is refused with `SCHEMA_MISMATCH`.
//! Values that fail the section's validation are rejected before any write.

use crate::errors::ScratchpadError;
use crate::scratchpad::layout::Section;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_yaml::Value;

pub const SCHEMA_VERSION_KEY: &str = "schema_version";

/// One-step migration for a section's payload.
pub struct Migration {
    pub section_key: &'static str,
    pub from: u32,
    pub apply: fn(Value) -> Result<Value, String>,
}

/// Registered migration chain. Fresh deployments have all sections at
/// version 1, so the table starts empty; steps are appended as section
/// schemas evolve.
static MIGRATIONS: &[Migration] = &[];

/// Current schema version for a section.
pub fn current_version(_section: &Section) -> u32 {
    1
}

/// Structural validation applied before any write and after migration.
pub fn validate(section: &Section, value: &Value) -> Result<(), String> {
    let map = value
        .as_mapping()
        .ok_or_else(|| "value must be a mapping".to_string())?;

    let required: &[&str] = match section {
        Section::Project => &["id", "name", "mode", "state"],
        Section::CollectedInfo => &["project_id"],
        Section::IssueList => &["project_id", "issues"],
        Section::DependencyGraph => &["nodes", "edges"],
        Section::WorkOrder(_) => &["id", "issue_id", "status"],
        Section::ImplementationResult(_) => &["order_id", "final_status"],
        Section::Review(_) => &["order_id", "decision"],
        Section::Checkpoint(_) => &["id", "work_order_id", "step"],
        Section::ControllerState => &["capacity", "workers"],
        Section::Session(_) => &["id", "mode", "status"],
        Section::Transitions => &["records"],
        // Markdown documents never reach here.
        Section::Prd | Section::Srs | Section::Sds => &[],
    };

    for key in required {
        if !map.contains_key(*key) {
            return Err(format!("missing required field '{key}'"));
        }
    }
    Ok(())
}

/// Serialize a value with the section's schema version stamped in.
pub fn encode<T: Serialize>(section: &Section, value: &T) -> Result<Value, ScratchpadError> {
    let mut encoded =
        serde_yaml::to_value(value).map_err(|e| ScratchpadError::Serialize {
            section: section.key(),
            message: e.to_string(),
        })?;

    validate(section, &encoded).map_err(|message| ScratchpadError::SchemaValidation {
        section: section.key(),
        message,
    })?;

    if let Value::Mapping(ref mut map) = encoded {
        map.insert(
            Value::String(SCHEMA_VERSION_KEY.to_string()),
            Value::Number(current_version(section).into()),
        );
    }
    Ok(encoded)
}

/// Deserialize a raw section value, migrating older versions in place.
pub fn decode<T: DeserializeOwned>(
    section: &Section,
    mut value: Value,
) -> Result<T, ScratchpadError> {
    let current = current_version(section);
    let mut found = extract_version(&mut value).unwrap_or(current);

    while found < current {
        let step = MIGRATIONS
            .iter()
            .find(|m| m.section_key == section.key() && m.from == found)
            .ok_or(ScratchpadError::SchemaMismatch {
                section: section.key(),
                found,
                current,
            })?;
        value = (step.apply)(value).map_err(|message| ScratchpadError::SchemaValidation {
            section: section.key(),
            message,
        })?;
        found += 1;
    }

    if found > current {
        return Err(ScratchpadError::SchemaMismatch {
            section: section.key(),
            found,
            current,
        });
    }

    validate(section, &value).map_err(|message| ScratchpadError::SchemaValidation {
        section: section.key(),
        message,
    })?;

    serde_yaml::from_value(value).map_err(|e| ScratchpadError::Serialize {
        section: section.key(),
        message: e.to_string(),
    })
}

/// Pull `schema_version` out of the mapping, leaving the payload clean for
/// deserialization into types that don't model it.
fn extract_version(value: &mut Value) -> Option<u32> {
    let map = value.as_mapping_mut()?;
    map.remove(SCHEMA_VERSION_KEY)
        .and_then(|v| v.as_u64())
        .map(|v| v as u32)
}

/// Run a migration chain against an explicit table. Exposed for tests so
/// chaining stays covered while the production table is empty.
#[cfg(test)]
pub(crate) fn migrate_with(
    table: &[Migration],
    section_key: &str,
    mut found: u32,
    current: u32,
    mut value: Value,
) -> Result<Value, ScratchpadError> {
    while found < current {
        let step = table
            .iter()
            .find(|m| m.section_key == section_key && m.from == found)
            .ok_or(ScratchpadError::SchemaMismatch {
                section: section_key.to_string(),
                found,
                current,
            })?;
        value = (step.apply)(value).map_err(|message| ScratchpadError::SchemaValidation {
            section: section_key.to_string(),
            message,
        })?;
        found += 1;
    }
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Doc {
        project_id: String,
        notes: Vec<String>,
    }

    #[test]
    fn encode_stamps_schema_version() {
        let doc = Doc {
            project_id: "p1".into(),
            notes: vec![],
        };
        let value = encode(&Section::CollectedInfo, &doc).unwrap();
        let map = value.as_mapping().unwrap();
        assert_eq!(map.get(SCHEMA_VERSION_KEY), Some(&Value::Number(1.into())));
    }

    #[test]
    fn round_trip_preserves_value() {
        let doc = Doc {
            project_id: "p1".into(),
            notes: vec!["a".into(), "b".into()],
        };
        let encoded = encode(&Section::CollectedInfo, &doc).unwrap();
        let decoded: Doc = decode(&Section::CollectedInfo, encoded).unwrap();
        assert_eq!(decoded, doc);
    }

    #[test]
    fn missing_required_field_is_rejected_before_write() {
        #[derive(Serialize)]
        struct Bad {
            notes: Vec<String>,
        }
        let result = encode(&Section::CollectedInfo, &Bad { notes: vec![] });
        assert!(matches!(
            result,
            Err(ScratchpadError::SchemaValidation { .. })
        ));
    }

    #[test]
    fn scalar_value_is_rejected() {
        let result = encode(&Section::CollectedInfo, &"just a string");
        assert!(matches!(
            result,
            Err(ScratchpadError::SchemaValidation { .. })
        ));
    }

    #[test]
    fn newer_version_is_refused() {
        let raw: Value =
            serde_yaml::from_str("schema_version: 9\nproject_id: p1\nnotes: []").unwrap();
        let result: Result<Doc, _> = decode(&Section::CollectedInfo, raw);
        assert!(matches!(
            result,
            Err(ScratchpadError::SchemaMismatch { found: 9, .. })
        ));
    }

    #[test]
    fn older_version_without_migrator_is_refused() {
        let raw: Value =
            serde_yaml::from_str("schema_version: 0\nproject_id: p1\nnotes: []").unwrap();
        let result: Result<Doc, _> = decode(&Section::CollectedInfo, raw);
        assert!(matches!(
            result,
            Err(ScratchpadError::SchemaMismatch { found: 0, .. })
        ));
    }

    #[test]
    fn migration_steps_chain_in_order() {
        fn add_notes(mut v: Value) -> Result<Value, String> {
            v.as_mapping_mut()
                .ok_or("not a mapping")?
                .insert(Value::String("notes".into()), Value::Sequence(vec![]));
            Ok(v)
        }
        fn rename_project(mut v: Value) -> Result<Value, String> {
            let map = v.as_mapping_mut().ok_or("not a mapping")?;
            if let Some(old) = map.remove("project") {
                map.insert(Value::String("project_id".into()), old);
            }
            Ok(v)
        }
        let table = [
            Migration {
                section_key: "collected_info",
                from: 1,
                apply: rename_project,
            },
            Migration {
                section_key: "collected_info",
                from: 2,
                apply: add_notes,
            },
        ];

        let raw: Value = serde_yaml::from_str("project: p1").unwrap();
        let migrated = migrate_with(&table, "collected_info", 1, 3, raw).unwrap();
        let doc: Doc = serde_yaml::from_value(migrated).unwrap();
        assert_eq!(doc.project_id, "p1");
        assert!(doc.notes.is_empty());
    }
}
