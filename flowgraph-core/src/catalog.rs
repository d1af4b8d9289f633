//! Node Catalog (C2): the closed set of node kinds, their arity, settings
//! schema, and the `validate_settings` / `schema_callback` pure factories
//! (§4.2). `build_plan` lives in `plan.rs` since it depends on `lazy::Op`.

use serde::{Deserialize, Serialize};

use crate::registry::is_assignable;
use crate::types::{Column, DataType, Schema, Value};

/// Identity of a node kind in the closed catalog (§3).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeKindId {
    Read,
    Filter,
    Select,
    Sort,
    Unique,
    Sample,
    Join,
    CrossJoin,
    Union,
    GroupBy,
    Pivot,
    Unpivot,
    Formula,
    RecordId,
    TextToRows,
    PolarsCode,
    GraphSolver,
    FuzzyMatch,
    Write,
    Explore,
}

/// Static descriptor for a kind: `(id, min_inputs, max_inputs, outputs,
/// category)` (§3). `outputs` is always 1 in the current catalog.
#[derive(Clone, Copy, Debug)]
pub struct NodeKind {
    pub id: NodeKindId,
    pub min_inputs: usize,
    pub max_inputs: Option<usize>,
    pub outputs: usize,
    pub category: &'static str,
}

impl NodeKind {
    pub const fn new(
        id: NodeKindId,
        min_inputs: usize,
        max_inputs: Option<usize>,
        category: &'static str,
    ) -> Self {
        Self {
            id,
            min_inputs,
            max_inputs,
            outputs: 1,
            category,
        }
    }
}

/// The full catalog, one entry per [`NodeKindId`]. A node that declares
/// `PolarsCode` falls back to the sandboxed evaluator (§4.2); it is still a
/// regular catalog entry, not special-cased here.
pub const CATALOG: &[NodeKind] = &[
    NodeKind::new(NodeKindId::Read, 0, Some(0), "input"),
    NodeKind::new(NodeKindId::Filter, 1, Some(1), "transform"),
    NodeKind::new(NodeKindId::Select, 1, Some(1), "transform"),
    NodeKind::new(NodeKindId::Sort, 1, Some(1), "transform"),
    NodeKind::new(NodeKindId::Unique, 1, Some(1), "transform"),
    NodeKind::new(NodeKindId::Sample, 1, Some(1), "transform"),
    NodeKind::new(NodeKindId::Join, 2, Some(2), "combine"),
    NodeKind::new(NodeKindId::CrossJoin, 2, Some(2), "combine"),
    NodeKind::new(NodeKindId::Union, 1, None, "combine"),
    NodeKind::new(NodeKindId::GroupBy, 1, Some(1), "transform"),
    NodeKind::new(NodeKindId::Pivot, 1, Some(1), "transform"),
    NodeKind::new(NodeKindId::Unpivot, 1, Some(1), "transform"),
    NodeKind::new(NodeKindId::Formula, 1, Some(1), "transform"),
    NodeKind::new(NodeKindId::RecordId, 1, Some(1), "transform"),
    NodeKind::new(NodeKindId::TextToRows, 1, Some(1), "transform"),
    NodeKind::new(NodeKindId::PolarsCode, 1, None, "custom"),
    NodeKind::new(NodeKindId::GraphSolver, 1, Some(1), "transform"),
    NodeKind::new(NodeKindId::FuzzyMatch, 2, Some(2), "combine"),
    NodeKind::new(NodeKindId::Write, 1, Some(1), "output"),
    NodeKind::new(NodeKindId::Explore, 1, Some(1), "output"),
];

pub fn kind_descriptor(id: NodeKindId) -> &'static NodeKind {
    CATALOG
        .iter()
        .find(|k| k.id == id)
        .expect("catalog is exhaustive over NodeKindId")
}

/// A single static check failure from `validate_settings` (§4.2).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ValidationError {
    pub field: String,
    pub message: String,
}

impl ValidationError {
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JoinHow {
    Inner,
    Left,
    Outer,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortDirection {
    Asc,
    Desc,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SortKey {
    pub column: String,
    pub direction: SortDirection,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FormulaColumn {
    pub name: String,
    pub expression: String,
    pub data_type: DataType,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AggExpr {
    pub input_column: String,
    pub output_column: String,
    pub function: String,
}

/// Kind-specific settings, always fully materialized with defaults filled in
/// at insertion time (§3 Node). Discriminated by `kind`, per the
/// re-architecture note on dynamic-typed settings (§9).
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum NodeSettings {
    Read {
        path: String,
        format: String,
        columns: Vec<Column>,
        etag: Option<String>,
    },
    Filter {
        predicate: String,
    },
    Select {
        columns: Vec<String>,
    },
    Sort {
        keys: Vec<SortKey>,
    },
    Unique {
        subset: Vec<String>,
        keep_first: bool,
    },
    Sample {
        n: usize,
        seed: Option<u64>,
    },
    Join {
        how: JoinHow,
        on: Vec<String>,
        right_suffix: String,
    },
    CrossJoin {
        left_suffix: String,
        right_suffix: String,
    },
    Union {
        diagonal_relaxed: bool,
    },
    GroupBy {
        group_by: Vec<String>,
        aggregations: Vec<AggExpr>,
    },
    Pivot {
        index: Vec<String>,
        on: String,
        values: String,
        agg_function: String,
    },
    Unpivot {
        index: Vec<String>,
        on: Vec<String>,
        variable_name: String,
        value_name: String,
    },
    Formula {
        columns: Vec<FormulaColumn>,
    },
    RecordId {
        output_column: String,
        offset: i64,
    },
    TextToRows {
        column: String,
        delimiter: String,
        output_column: String,
    },
    PolarsCode {
        code: String,
    },
    GraphSolver {
        from_column: String,
        to_column: String,
        output_column: String,
    },
    FuzzyMatch {
        left_on: String,
        right_on: String,
        threshold: f64,
        right_suffix: String,
    },
    Write {
        path: String,
        format: String,
        default_value: Option<Value>,
    },
    Explore {
        max_rows: usize,
    },
}

impl NodeSettings {
    pub fn kind_id(&self) -> NodeKindId {
        match self {
            NodeSettings::Read { .. } => NodeKindId::Read,
            NodeSettings::Filter { .. } => NodeKindId::Filter,
            NodeSettings::Select { .. } => NodeKindId::Select,
            NodeSettings::Sort { .. } => NodeKindId::Sort,
            NodeSettings::Unique { .. } => NodeKindId::Unique,
            NodeSettings::Sample { .. } => NodeKindId::Sample,
            NodeSettings::Join { .. } => NodeKindId::Join,
            NodeSettings::CrossJoin { .. } => NodeKindId::CrossJoin,
            NodeSettings::Union { .. } => NodeKindId::Union,
            NodeSettings::GroupBy { .. } => NodeKindId::GroupBy,
            NodeSettings::Pivot { .. } => NodeKindId::Pivot,
            NodeSettings::Unpivot { .. } => NodeKindId::Unpivot,
            NodeSettings::Formula { .. } => NodeKindId::Formula,
            NodeSettings::RecordId { .. } => NodeKindId::RecordId,
            NodeSettings::TextToRows { .. } => NodeKindId::TextToRows,
            NodeSettings::PolarsCode { .. } => NodeKindId::PolarsCode,
            NodeSettings::GraphSolver { .. } => NodeKindId::GraphSolver,
            NodeSettings::FuzzyMatch { .. } => NodeKindId::FuzzyMatch,
            NodeSettings::Write { .. } => NodeKindId::Write,
            NodeSettings::Explore { .. } => NodeKindId::Explore,
        }
    }
}

/// Structural + semantic checks, independent of input schemas (§4.2). Schema
/// existence checks that need input schemas are re-checked in
/// `schema_callback`, which is the only place predecessor schemas are known.
pub fn validate_settings(settings: &NodeSettings) -> Vec<ValidationError> {
    let mut errs = Vec::new();
    match settings {
        NodeSettings::Read { path, columns, .. } => {
            if path.trim().is_empty() {
                errs.push(ValidationError::new("path", "path must not be empty"));
            }
            if columns.is_empty() {
                errs.push(ValidationError::new("columns", "read must declare at least one column"));
            }
        }
        NodeSettings::Filter { predicate } => {
            if predicate.trim().is_empty() {
                errs.push(ValidationError::new("predicate", "predicate must not be empty"));
            }
        }
        NodeSettings::Select { columns } => {
            if columns.is_empty() {
                errs.push(ValidationError::new("columns", "select must keep at least one column"));
            }
        }
        NodeSettings::Sort { keys } => {
            if keys.is_empty() {
                errs.push(ValidationError::new("keys", "sort must declare at least one key"));
            }
        }
        NodeSettings::Sample { n, .. } => {
            if *n == 0 {
                errs.push(ValidationError::new("n", "sample size must be > 0"));
            }
        }
        NodeSettings::Join { on, .. } => {
            if on.is_empty() {
                errs.push(ValidationError::new("on", "join must declare at least one key column"));
            }
        }
        NodeSettings::GroupBy { aggregations, .. } => {
            if aggregations.is_empty() {
                errs.push(ValidationError::new(
                    "aggregations",
                    "group-by must declare at least one aggregation",
                ));
            }
        }
        NodeSettings::Pivot { on, values, .. } => {
            if on.trim().is_empty() || values.trim().is_empty() {
                errs.push(ValidationError::new("on", "pivot requires 'on' and 'values' columns"));
            }
        }
        NodeSettings::Unpivot { on, .. } => {
            if on.is_empty() {
                errs.push(ValidationError::new("on", "unpivot must declare at least one column"));
            }
        }
        NodeSettings::Formula { columns } => {
            if columns.is_empty() {
                errs.push(ValidationError::new("columns", "formula must declare at least one column"));
            }
            for c in columns {
                if c.name.trim().is_empty() {
                    errs.push(ValidationError::new("columns[].name", "formula column name must not be empty"));
                }
            }
        }
        NodeSettings::RecordId { output_column, .. } => {
            if output_column.trim().is_empty() {
                errs.push(ValidationError::new("output_column", "output_column must not be empty"));
            }
        }
        NodeSettings::TextToRows { delimiter, .. } => {
            if delimiter.is_empty() {
                errs.push(ValidationError::new("delimiter", "delimiter must not be empty"));
            }
        }
        NodeSettings::PolarsCode { code } => {
            if code.trim().is_empty() {
                errs.push(ValidationError::new("code", "code must not be empty"));
            }
        }
        NodeSettings::FuzzyMatch { threshold, .. } => {
            if !(0.0..=1.0).contains(threshold) {
                errs.push(ValidationError::new("threshold", "threshold must be within [0, 1]"));
            }
        }
        NodeSettings::Write { path, .. } => {
            if path.trim().is_empty() {
                errs.push(ValidationError::new("path", "path must not be empty"));
            }
        }
        NodeSettings::Explore { max_rows } => {
            if *max_rows == 0 {
                errs.push(ValidationError::new("max_rows", "max_rows must be > 0"));
            }
        }
        NodeSettings::Unique { .. }
        | NodeSettings::CrossJoin { .. }
        | NodeSettings::Union { .. }
        | NodeSettings::GraphSolver { .. } => {}
    }
    errs
}

/// Predicts the output schema from predecessor schemas, without executing
/// anything (§4.2, §4.4). `inputs` is ordered to match the node's declared
/// ports (`main`, `right`, or `union[i]`).
pub fn schema_callback(settings: &NodeSettings, inputs: &[Schema]) -> Result<Schema, String> {
    match settings {
        NodeSettings::Read { columns, .. } => Ok(Schema::new(columns.clone())),

        NodeSettings::Filter { .. } | NodeSettings::Sort { .. } | NodeSettings::Unique { .. } => {
            Ok(inputs.first().cloned().unwrap_or_default())
        }

        NodeSettings::Sample { .. } | NodeSettings::Explore { .. } => {
            Ok(inputs.first().cloned().unwrap_or_default())
        }

        NodeSettings::Select { columns } => {
            let input = inputs.first().cloned().unwrap_or_default();
            let mut out = Schema::empty();
            for name in columns {
                let col = input
                    .column(name)
                    .ok_or_else(|| format!("select: column '{name}' not found in input schema"))?;
                out.push(col.clone());
            }
            Ok(out)
        }

        NodeSettings::Join { on, right_suffix, .. } => {
            let left = inputs.first().cloned().unwrap_or_default();
            let right = inputs.get(1).cloned().unwrap_or_default();
            let mut out = left.clone();
            for col in right.iter() {
                if on.contains(&col.name) {
                    continue;
                }
                if left.contains(&col.name) {
                    out.push(Column::new(format!("{}{}", col.name, right_suffix), col.data_type.clone(), col.nullable));
                } else {
                    out.push(col.clone());
                }
            }
            Ok(out)
        }

        NodeSettings::CrossJoin { left_suffix, right_suffix } => {
            let left = inputs.first().cloned().unwrap_or_default();
            let right = inputs.get(1).cloned().unwrap_or_default();
            let mut out = Schema::empty();
            for col in left.iter() {
                if right.contains(&col.name) {
                    out.push(Column::new(format!("{}{}", col.name, left_suffix), col.data_type.clone(), col.nullable));
                } else {
                    out.push(col.clone());
                }
            }
            for col in right.iter() {
                if left.contains(&col.name) {
                    out.push(Column::new(format!("{}{}", col.name, right_suffix), col.data_type.clone(), col.nullable));
                } else {
                    out.push(col.clone());
                }
            }
            Ok(out)
        }

        NodeSettings::Union { .. } => {
            // Insertion order of predecessor schemas defines column alignment
            // (design-note decision recorded in DESIGN.md): the union of
            // column names, typed by the first input that declares each one.
            let mut out = Schema::empty();
            for input in inputs {
                for col in input.iter() {
                    if !out.contains(&col.name) {
                        out.push(col.clone());
                    }
                }
            }
            Ok(out)
        }

        NodeSettings::GroupBy { group_by, aggregations } => {
            let input = inputs.first().cloned().unwrap_or_default();
            let mut out = Schema::empty();
            for name in group_by {
                let col = input
                    .column(name)
                    .ok_or_else(|| format!("group_by: column '{name}' not found"))?;
                out.push(col.clone());
            }
            for agg in aggregations {
                let src = input
                    .column(&agg.input_column)
                    .ok_or_else(|| format!("group_by: aggregation input '{}' not found", agg.input_column))?;
                let ty = match agg.function.as_str() {
                    "count" => DataType::Int64,
                    "mean" | "avg" => DataType::Float64,
                    _ => src.data_type.clone(),
                };
                out.push(Column::new(agg.output_column.clone(), ty, true));
            }
            Ok(out)
        }

        NodeSettings::Pivot { index, values, .. } => {
            let input = inputs.first().cloned().unwrap_or_default();
            let mut out = Schema::empty();
            for name in index {
                if let Some(col) = input.column(name) {
                    out.push(col.clone());
                }
            }
            // The pivoted column set depends on runtime data; predicted
            // statically we can only guarantee the index columns plus a
            // representative value column typed like the source.
            if let Some(col) = input.column(values) {
                out.push(col.clone());
            }
            Ok(out)
        }

        NodeSettings::Unpivot {
            index,
            variable_name,
            value_name,
            ..
        } => {
            let input = inputs.first().cloned().unwrap_or_default();
            let mut out = Schema::empty();
            for name in index {
                if let Some(col) = input.column(name) {
                    out.push(col.clone());
                }
            }
            out.push(Column::new(variable_name.clone(), DataType::String, false));
            out.push(Column::new(value_name.clone(), DataType::String, true));
            Ok(out)
        }

        NodeSettings::Formula { columns } => {
            let mut out = inputs.first().cloned().unwrap_or_default();
            for fc in columns {
                if let Some(existing) = out.0.iter_mut().find(|c| c.name == fc.name) {
                    existing.data_type = fc.data_type.clone();
                } else {
                    out.push(Column::new(fc.name.clone(), fc.data_type.clone(), true));
                }
            }
            Ok(out)
        }

        NodeSettings::RecordId { output_column, .. } => {
            let mut out = inputs.first().cloned().unwrap_or_default();
            out.push(Column::new(output_column.clone(), DataType::Int64, false));
            Ok(out)
        }

        NodeSettings::TextToRows { output_column, .. } => {
            let mut out = inputs.first().cloned().unwrap_or_default();
            out.push(Column::new(output_column.clone(), DataType::String, true));
            Ok(out)
        }

        NodeSettings::PolarsCode { .. } => {
            // Dry-run on empty frames is the runtime's job (§4.2); the core
            // catalog cannot predict arbitrary user code statically, so it
            // conservatively echoes the first input's schema.
            Ok(inputs.first().cloned().unwrap_or_default())
        }

        NodeSettings::GraphSolver { output_column, .. } => {
            let mut out = inputs.first().cloned().unwrap_or_default();
            out.push(Column::new(output_column.clone(), DataType::Int64, true));
            Ok(out)
        }

        NodeSettings::FuzzyMatch { right_suffix, .. } => {
            let left = inputs.first().cloned().unwrap_or_default();
            let right = inputs.get(1).cloned().unwrap_or_default();
            let mut out = left.clone();
            for col in right.iter() {
                if left.contains(&col.name) {
                    out.push(Column::new(format!("{}{}", col.name, right_suffix), col.data_type.clone(), col.nullable));
                } else {
                    out.push(col.clone());
                }
            }
            out.push(Column::new("match_score", DataType::Float64, true));
            Ok(out)
        }

        NodeSettings::Write { .. } => Ok(inputs.first().cloned().unwrap_or_default()),
    }
}

/// Checks an output-field default expression against the field's declared
/// type (used by `output_validator`); lives here since it needs the
/// registry's assignability rule and the catalog's notion of a settings
/// field.
pub fn default_is_assignable(default: &DataType, field: &DataType) -> bool {
    is_assignable(default, field)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn catalog_is_exhaustive_and_has_stable_arity() {
        let read = kind_descriptor(NodeKindId::Read);
        assert_eq!(read.min_inputs, 0);
        let join = kind_descriptor(NodeKindId::Join);
        assert_eq!(join.min_inputs, 2);
        let union = kind_descriptor(NodeKindId::Union);
        assert_eq!(union.max_inputs, None);
    }

    #[test]
    fn select_schema_errors_on_missing_column() {
        let input = Schema::new(vec![Column::new("id", DataType::Int64, false)]);
        let settings = NodeSettings::Select { columns: vec!["missing".into()] };
        let err = schema_callback(&settings, &[input]).unwrap_err();
        assert!(err.contains("missing"));
    }

    #[test]
    fn join_schema_suffixes_right_duplicates() {
        let left = Schema::new(vec![
            Column::new("k", DataType::Int64, false),
            Column::new("v", DataType::Int64, false),
        ]);
        let right = Schema::new(vec![
            Column::new("k", DataType::Int64, false),
            Column::new("v", DataType::Int64, false),
        ]);
        let settings = NodeSettings::Join {
            how: JoinHow::Inner,
            on: vec!["k".into()],
            right_suffix: "_right".into(),
        };
        let out = schema_callback(&settings, &[left, right]).unwrap();
        assert_eq!(out.names(), vec!["k", "v", "v_right"]);
    }

    #[test]
    fn union_schema_follows_insertion_order() {
        let a = Schema::new(vec![Column::new("a", DataType::Int64, false)]);
        let b = Schema::new(vec![Column::new("b", DataType::String, true)]);
        let settings = NodeSettings::Union { diagonal_relaxed: true };
        let out = schema_callback(&settings, &[a, b]).unwrap();
        assert_eq!(out.names(), vec!["a", "b"]);
    }

    #[test]
    fn validate_settings_flags_empty_predicate() {
        let errs = validate_settings(&NodeSettings::Filter { predicate: "".into() });
        assert_eq!(errs.len(), 1);
        assert_eq!(errs[0].field, "predicate");
    }
}
