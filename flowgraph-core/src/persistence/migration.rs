//! Versioned migration hooks for the YAML format [SUPPLEMENT] (§4.10: "version
//! mismatch triggers a migration hook registered per `(from_version,
//! to_version)` pair"). Registered as a closed table populated at
//! construction, mirroring the catalog's closed-set-of-factories idiom
//! rather than dynamic plugin loading.

use std::collections::BTreeMap;

use serde_yaml::Value;

use crate::error::FlowError;

pub type MigrationFn = fn(Value) -> Result<Value, FlowError>;

pub struct MigrationRegistry {
    hooks: BTreeMap<(String, String), MigrationFn>,
}

impl MigrationRegistry {
    pub fn new() -> Self {
        let mut hooks: BTreeMap<(String, String), MigrationFn> = BTreeMap::new();
        hooks.insert(("1.0".to_string(), "2.0".to_string()), migrate_1_0_to_2_0);
        Self { hooks }
    }

    /// Applies the registered hook for `(from, to)`, or fails with a
    /// `graph_structure`-tagged error if no migration path exists.
    pub fn migrate(&self, from: &str, to: &str, document: Value) -> Result<Value, FlowError> {
        if from == to {
            return Ok(document);
        }
        let key = (from.to_string(), to.to_string());
        match self.hooks.get(&key) {
            Some(hook) => hook(document),
            None => Err(FlowError::GraphStructure(format!(
                "no migration registered from version '{from}' to '{to}'"
            ))),
        }
    }
}

impl Default for MigrationRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// `1.0` had no `flow_settings.execution_location` field; default it to
/// `Local` and bump the version tag.
fn migrate_1_0_to_2_0(mut document: Value) -> Result<Value, FlowError> {
    if let Value::Mapping(map) = &mut document {
        map.insert(Value::String("version".into()), Value::String("2.0".into()));
        if let Some(Value::Mapping(settings)) = map.get_mut(Value::String("flow_settings".into())) {
            settings
                .entry(Value::String("execution_location".into()))
                .or_insert(Value::String("local".into()));
        }
    }
    Ok(document)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn migrates_1_0_document_to_2_0() {
        let registry = MigrationRegistry::new();
        let doc: Value = serde_yaml::from_str("version: \"1.0\"\nflow_settings: {}\n").unwrap();
        let migrated = registry.migrate("1.0", "2.0", doc).unwrap();
        let version = migrated.get(Value::String("version".into())).unwrap();
        assert_eq!(version, &Value::String("2.0".into()));
    }

    #[test]
    fn unknown_migration_path_fails() {
        let registry = MigrationRegistry::new();
        let doc: Value = serde_yaml::from_str("version: \"0.1\"\n").unwrap();
        assert!(registry.migrate("0.1", "2.0", doc).is_err());
    }
}
