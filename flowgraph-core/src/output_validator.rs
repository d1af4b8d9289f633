//! Output-Field Validator (C9): the per-node declarative output contract
//! (§4.9), applied after the worker returns a result but before it enters
//! the Cache.

use serde::{Deserialize, Serialize};

use crate::error::FlowError;
use crate::registry::is_assignable;
use crate::types::{Column, DataType, Schema, Value};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VmBehavior {
    SelectOnly,
    AddMissing,
    RaiseOnMissing,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OutputField {
    pub name: String,
    pub data_type: DataType,
    pub default_expression: Option<Value>,
}

/// `(enabled, vm_behavior, fields)` (§3). `fields` is ordered; order is part
/// of the contract for `select_only`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OutputFieldConfig {
    pub enabled: bool,
    pub vm_behavior: VmBehavior,
    pub fields: Vec<OutputField>,
}

impl OutputFieldConfig {
    /// The schema the Schema Propagator synthesizes directly from `fields`
    /// when `enabled` (§4.4, §4.9): prediction becomes exact and O(1).
    pub fn synthesized_schema(&self) -> Schema {
        Schema::new(
            self.fields
                .iter()
                .map(|f| Column::new(f.name.clone(), f.data_type.clone(), f.default_expression.is_none()))
                .collect(),
        )
    }
}

/// A materialized result, as returned by the worker (§4.8 `/result` +
/// `/sample`), expressed just enough to validate and reshape it.
#[derive(Clone, Debug)]
pub struct ActualResult {
    pub schema: Schema,
    pub row_count: u64,
    /// The full payload this in-process runtime already holds in memory
    /// (stands in for fetching `payload_location`, §4.6). `validate`
    /// reshapes this in lockstep with `schema` so arity never drifts.
    pub rows: Vec<Vec<Value>>,
    /// First few rows, bounded (§4.11 `/sample`). Always a prefix of `rows`.
    pub sample: Vec<Vec<Value>>,
}

/// Applies `vm_behavior` to an actual result (§4.9), returning a new
/// `ActualResult` whose `rows`/`sample` arity always matches its `schema` —
/// `select_only` drops columns from every row, `add_missing` fills
/// `default_expression` into every row, `raise_on_missing` passes the
/// payload through unchanged once presence/type checks succeed.
pub fn validate(config: &OutputFieldConfig, actual: &ActualResult) -> Result<ActualResult, FlowError> {
    if !config.enabled {
        return Ok(actual.clone());
    }

    match config.vm_behavior {
        VmBehavior::SelectOnly => {
            let mut out_schema = Schema::empty();
            let mut indices = Vec::with_capacity(config.fields.len());
            for field in &config.fields {
                let actual_col = actual.schema.column(&field.name).ok_or_else(|| {
                    FlowError::Validation(format!(
                        "select_only: field '{}' absent from actual schema",
                        field.name
                    ))
                })?;
                if !is_assignable(&actual_col.data_type, &field.data_type) {
                    return Err(FlowError::Validation(format!(
                        "select_only: field '{}' has type {:?}, expected assignable to {:?}",
                        field.name, actual_col.data_type, field.data_type
                    )));
                }
                out_schema.push(Column::new(field.name.clone(), field.data_type.clone(), actual_col.nullable));
                indices.push(actual.schema.names().iter().position(|n| *n == field.name).unwrap());
            }
            let reshape = |rows: &[Vec<Value>]| -> Vec<Vec<Value>> {
                rows.iter().map(|row| indices.iter().map(|&i| row[i].clone()).collect()).collect()
            };
            Ok(ActualResult {
                schema: out_schema,
                row_count: actual.row_count,
                rows: reshape(&actual.rows),
                sample: reshape(&actual.sample),
            })
        }

        VmBehavior::AddMissing => {
            let mut out_schema = actual.schema.clone();
            let mut defaults = Vec::new();
            for field in &config.fields {
                if !out_schema.contains(&field.name) {
                    let default = field.default_expression.clone().ok_or_else(|| {
                        FlowError::Validation(format!(
                            "add_missing: field '{}' missing from actual schema and has no default_expression",
                            field.name
                        ))
                    })?;
                    out_schema.push(Column::new(field.name.clone(), field.data_type.clone(), false));
                    defaults.push(default);
                }
            }
            let extend = |rows: &[Vec<Value>]| -> Vec<Vec<Value>> {
                rows.iter()
                    .map(|row| {
                        let mut row = row.clone();
                        row.extend(defaults.iter().cloned());
                        row
                    })
                    .collect()
            };
            Ok(ActualResult {
                schema: out_schema,
                row_count: actual.row_count,
                rows: extend(&actual.rows),
                sample: extend(&actual.sample),
            })
        }

        VmBehavior::RaiseOnMissing => {
            for field in &config.fields {
                let actual_col = actual.schema.column(&field.name).ok_or_else(|| {
                    FlowError::Validation(format!(
                        "raise_on_missing: field '{}' missing from actual schema",
                        field.name
                    ))
                })?;
                if !is_assignable(&actual_col.data_type, &field.data_type) {
                    return Err(FlowError::Validation(format!(
                        "raise_on_missing: field '{}' has incompatible type",
                        field.name
                    )));
                }
            }
            Ok(actual.clone())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(behavior: VmBehavior) -> OutputFieldConfig {
        OutputFieldConfig {
            enabled: true,
            vm_behavior: behavior,
            fields: vec![
                OutputField { name: "id".into(), data_type: DataType::Int64, default_expression: None },
                OutputField {
                    name: "flag".into(),
                    data_type: DataType::Boolean,
                    default_expression: Some(Value::Bool(true)),
                },
            ],
        }
    }

    #[test]
    fn add_missing_appends_default_column() {
        let actual = ActualResult {
            schema: Schema::new(vec![Column::new("id", DataType::Int64, false)]),
            row_count: 3,
            rows: vec![vec![Value::I64(1)], vec![Value::I64(2)], vec![Value::I64(3)]],
            sample: vec![vec![Value::I64(1)], vec![Value::I64(2)]],
        };
        let out = validate(&config(VmBehavior::AddMissing), &actual).unwrap();
        assert_eq!(out.schema.names(), vec!["id", "flag"]);
        assert!(out.rows.iter().all(|row| row.len() == 2 && row[1] == Value::Bool(true)));
        assert!(out.sample.iter().all(|row| row[1] == Value::Bool(true)));
    }

    #[test]
    fn add_missing_without_default_is_an_error() {
        let mut cfg = config(VmBehavior::AddMissing);
        cfg.fields[1].default_expression = None;
        let actual = ActualResult {
            schema: Schema::new(vec![Column::new("id", DataType::Int64, false)]),
            row_count: 1,
            rows: vec![vec![Value::I64(1)]],
            sample: vec![vec![Value::I64(1)]],
        };
        let err = validate(&cfg, &actual).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Validation);
    }

    #[test]
    fn select_only_fails_on_missing_field() {
        let actual = ActualResult {
            schema: Schema::new(vec![Column::new("id", DataType::Int64, false)]),
            row_count: 0,
            rows: vec![],
            sample: vec![],
        };
        let err = validate(&config(VmBehavior::SelectOnly), &actual).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Validation);
    }

    #[test]
    fn select_only_reshapes_rows_to_configured_columns() {
        let actual = ActualResult {
            schema: Schema::new(vec![
                Column::new("extra", DataType::String, false),
                Column::new("id", DataType::Int64, false),
                Column::new("flag", DataType::Boolean, false),
            ]),
            row_count: 1,
            rows: vec![vec![Value::Str("x".into()), Value::I64(7), Value::Bool(false)]],
            sample: vec![vec![Value::Str("x".into()), Value::I64(7), Value::Bool(false)]],
        };
        let out = validate(&config(VmBehavior::SelectOnly), &actual).unwrap();
        assert_eq!(out.schema.names(), vec!["id", "flag"]);
        assert_eq!(out.rows, vec![vec![Value::I64(7), Value::Bool(false)]]);
    }

    #[test]
    fn raise_on_missing_fails_on_incompatible_type() {
        let actual = ActualResult {
            schema: Schema::new(vec![
                Column::new("id", DataType::Int64, false),
                Column::new("flag", DataType::String, false),
            ]),
            row_count: 0,
            rows: vec![],
            sample: vec![],
        };
        assert!(validate(&config(VmBehavior::RaiseOnMissing), &actual).is_err());
    }

    #[test]
    fn synthesized_schema_matches_field_order() {
        let cfg = config(VmBehavior::SelectOnly);
        let schema = cfg.synthesized_schema();
        assert_eq!(schema.names(), vec!["id", "flag"]);
    }
}
