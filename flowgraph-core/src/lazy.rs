//! Minimal in-process lazy query runtime [SUPPLEMENT]. Stands in for the
//! opaque dataframe engine described in §2: a small columnar, row-oriented
//! evaluator covering the closed catalog's operators. No query optimizer —
//! an explicit non-goal (§1) — plans are executed exactly as built.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::catalog::{JoinHow, NodeSettings, SortDirection};
use crate::error::FlowError;
use crate::types::{Schema, Value};

/// A single row, aligned positionally to a [`Schema`].
pub type Row = Vec<Value>;

/// A materialized result: schema plus rows. Playing the role of the
/// "opaque" dataframe the worker hands back to the coordinator (§4.8
/// `/result`); in this minimal runtime it is simply collected in memory.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Frame {
    pub schema: Schema,
    pub rows: Vec<Row>,
}

impl Frame {
    pub fn empty(schema: Schema) -> Self {
        Self { schema, rows: Vec::new() }
    }

    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    fn column_index(&self, name: &str) -> Option<usize> {
        self.schema.0.iter().position(|c| c.name == name)
    }
}

/// A deferred, composable operator tree (`LazyPlan`, GLOSSARY). Building one
/// does not execute anything; `Plan::execute` is the single evaluation
/// entrypoint, called by the worker once a task is dispatched.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum Plan {
    /// A previously materialized frame, substituted in place of a subtree
    /// whose fingerprint has a valid `CacheEntry` (§4.5 "scan-from-cache").
    ScanFromCache(Box<Frame>),
    Source(Box<Frame>),
    Filter { input: Box<Plan>, predicate: String },
    Select { input: Box<Plan>, columns: Vec<String> },
    Sort { input: Box<Plan>, keys: Vec<(String, SortDirection)> },
    Unique { input: Box<Plan>, subset: Vec<String>, keep_first: bool },
    Sample { input: Box<Plan>, n: usize, seed: Option<u64> },
    Join { left: Box<Plan>, right: Box<Plan>, how: JoinHow, on: Vec<String>, right_suffix: String },
    CrossJoin { left: Box<Plan>, right: Box<Plan>, left_suffix: String, right_suffix: String },
    Union { inputs: Vec<Plan> },
    GroupBy { input: Box<Plan>, group_by: Vec<String>, aggregations: Vec<crate::catalog::AggExpr> },
    Formula { input: Box<Plan>, columns: Vec<crate::catalog::FormulaColumn> },
    RecordId { input: Box<Plan>, output_column: String, offset: i64 },
}

impl Plan {
    /// Collects the plan into a [`Frame`]. This is the only place the
    /// runtime actually touches data; schema prediction (§4.4) never calls
    /// this.
    pub fn execute(&self) -> Result<Frame, FlowError> {
        match self {
            Plan::ScanFromCache(frame) | Plan::Source(frame) => Ok((**frame).clone()),

            Plan::Filter { input, predicate } => {
                let frame = input.execute()?;
                let idx = frame
                    .column_index(column_in_predicate(predicate).as_deref().unwrap_or(""))
                    .ok_or_else(|| FlowError::Runtime(format!("filter: cannot resolve predicate '{predicate}'")))?;
                let (op, rhs) = parse_comparison(predicate)
                    .ok_or_else(|| FlowError::Runtime(format!("filter: unsupported predicate '{predicate}'")))?;
                let rows = frame
                    .rows
                    .into_iter()
                    .filter(|row| evaluate_comparison(&row[idx], op, &rhs))
                    .collect();
                Ok(Frame { schema: frame.schema, rows })
            }

            Plan::Select { input, columns } => {
                let frame = input.execute()?;
                let indices: Result<Vec<usize>, FlowError> = columns
                    .iter()
                    .map(|c| frame.column_index(c).ok_or_else(|| FlowError::Runtime(format!("select: column '{c}' not found"))))
                    .collect();
                let indices = indices?;
                let schema = crate::types::Schema::new(indices.iter().map(|&i| frame.schema.0[i].clone()).collect());
                let rows = frame
                    .rows
                    .iter()
                    .map(|row| indices.iter().map(|&i| row[i].clone()).collect())
                    .collect();
                Ok(Frame { schema, rows })
            }

            Plan::Sort { input, keys } => {
                let mut frame = input.execute()?;
                let resolved: Vec<(usize, SortDirection)> = keys
                    .iter()
                    .filter_map(|(name, dir)| frame.column_index(name).map(|i| (i, *dir)))
                    .collect();
                frame.rows.sort_by(|a, b| {
                    for (idx, dir) in &resolved {
                        let ord = compare_values(&a[*idx], &b[*idx]);
                        let ord = if *dir == SortDirection::Desc { ord.reverse() } else { ord };
                        if ord != std::cmp::Ordering::Equal {
                            return ord;
                        }
                    }
                    std::cmp::Ordering::Equal
                });
                Ok(frame)
            }

            Plan::Unique { input, subset, keep_first } => {
                let frame = input.execute()?;
                let indices: Vec<usize> = if subset.is_empty() {
                    (0..frame.schema.len()).collect()
                } else {
                    subset.iter().filter_map(|c| frame.column_index(c)).collect()
                };
                let mut seen = std::collections::HashSet::new();
                let mut rows = Vec::new();
                let iter: Box<dyn Iterator<Item = Row>> = if *keep_first {
                    Box::new(frame.rows.into_iter())
                } else {
                    Box::new(frame.rows.into_iter().rev())
                };
                for row in iter {
                    let key: Vec<String> = indices.iter().map(|&i| row[i].to_string()).collect();
                    if seen.insert(key) {
                        rows.push(row);
                    }
                }
                if !*keep_first {
                    rows.reverse();
                }
                Ok(Frame { schema: frame.schema, rows })
            }

            Plan::Sample { input, n, seed } => {
                let frame = input.execute()?;
                let mut rows = frame.rows;
                let mut state = seed.unwrap_or(0x9E3779B97F4A7C15);
                // xorshift64*, deterministic given a seed — sufficient for a
                // sampling node that only needs reproducibility, not quality.
                let mut next = move || {
                    state ^= state << 13;
                    state ^= state >> 7;
                    state ^= state << 17;
                    state
                };
                for i in (1..rows.len()).rev() {
                    let j = (next() as usize) % (i + 1);
                    rows.swap(i, j);
                }
                rows.truncate(*n);
                Ok(Frame { schema: frame.schema, rows })
            }

            Plan::Join { left, right, on, right_suffix, .. } => {
                let left_frame = left.execute()?;
                let right_frame = right.execute()?;
                let left_key_idx: Vec<usize> = on.iter().filter_map(|c| left_frame.column_index(c)).collect();
                let right_key_idx: Vec<usize> = on.iter().filter_map(|c| right_frame.column_index(c)).collect();

                let mut index: HashMap<Vec<String>, Vec<&Row>> = HashMap::new();
                for row in &right_frame.rows {
                    let key: Vec<String> = right_key_idx.iter().map(|&i| row[i].to_string()).collect();
                    index.entry(key).or_default().push(row);
                }

                let right_pass_idx: Vec<usize> = (0..right_frame.schema.len()).filter(|i| !right_key_idx.contains(i)).collect();
                let mut schema = left_frame.schema.clone();
                for &i in &right_pass_idx {
                    let col = &right_frame.schema.0[i];
                    let name = if left_frame.schema.contains(&col.name) {
                        format!("{}{}", col.name, right_suffix)
                    } else {
                        col.name.clone()
                    };
                    schema.push(crate::types::Column::new(name, col.data_type.clone(), true));
                }

                let mut rows = Vec::new();
                for lrow in &left_frame.rows {
                    let key: Vec<String> = left_key_idx.iter().map(|&i| lrow[i].to_string()).collect();
                    if let Some(matches) = index.get(&key) {
                        for rrow in matches {
                            let mut out = lrow.clone();
                            out.extend(right_pass_idx.iter().map(|&i| rrow[i].clone()));
                            rows.push(out);
                        }
                    }
                }
                Ok(Frame { schema, rows })
            }

            Plan::CrossJoin { left, right, .. } => {
                let left_frame = left.execute()?;
                let right_frame = right.execute()?;
                let mut schema = left_frame.schema.clone();
                for col in right_frame.schema.iter() {
                    schema.push(col.clone());
                }
                let mut rows = Vec::new();
                for lrow in &left_frame.rows {
                    for rrow in &right_frame.rows {
                        let mut out = lrow.clone();
                        out.extend(rrow.iter().cloned());
                        rows.push(out);
                    }
                }
                Ok(Frame { schema, rows })
            }

            Plan::Union { inputs } => {
                let frames: Result<Vec<Frame>, FlowError> = inputs.iter().map(Plan::execute).collect();
                let frames = frames?;
                let mut schema = crate::types::Schema::empty();
                for frame in &frames {
                    for col in frame.schema.iter() {
                        if !schema.contains(&col.name) {
                            schema.push(col.clone());
                        }
                    }
                }
                let mut rows = Vec::new();
                for frame in frames {
                    for row in frame.rows {
                        let mut out = vec![Value::Null; schema.len()];
                        for (i, col) in frame.schema.iter().enumerate() {
                            if let Some(pos) = schema.0.iter().position(|c| c.name == col.name) {
                                out[pos] = row[i].clone();
                            }
                        }
                        rows.push(out);
                    }
                }
                Ok(Frame { schema, rows })
            }

            Plan::GroupBy { input, group_by, aggregations } => {
                let frame = input.execute()?;
                let group_idx: Vec<usize> = group_by.iter().filter_map(|c| frame.column_index(c)).collect();
                let mut groups: HashMap<Vec<String>, Vec<&Row>> = HashMap::new();
                let mut order: Vec<Vec<String>> = Vec::new();
                for row in &frame.rows {
                    let key: Vec<String> = group_idx.iter().map(|&i| row[i].to_string()).collect();
                    if !groups.contains_key(&key) {
                        order.push(key.clone());
                    }
                    groups.entry(key).or_default().push(row);
                }

                let mut schema = crate::types::Schema::empty();
                for &i in &group_idx {
                    schema.push(frame.schema.0[i].clone());
                }
                for agg in aggregations {
                    let ty = match agg.function.as_str() {
                        "count" => crate::types::DataType::Int64,
                        "mean" | "avg" => crate::types::DataType::Float64,
                        _ => frame.column_index(&agg.input_column).map(|i| frame.schema.0[i].data_type.clone()).unwrap_or(crate::types::DataType::Unknown),
                    };
                    schema.push(crate::types::Column::new(agg.output_column.clone(), ty, true));
                }

                let mut rows = Vec::new();
                for key in order {
                    let members = &groups[&key];
                    let mut out: Row = key.into_iter().map(Value::Str).collect();
                    for agg in aggregations {
                        let col_idx = frame.column_index(&agg.input_column);
                        let value = match (agg.function.as_str(), col_idx) {
                            ("count", _) => Value::I64(members.len() as i64),
                            ("sum", Some(i)) => Value::F64(members.iter().filter_map(|r| as_f64(&r[i])).sum()),
                            ("mean" | "avg", Some(i)) => {
                                let vals: Vec<f64> = members.iter().filter_map(|r| as_f64(&r[i])).collect();
                                if vals.is_empty() {
                                    Value::Null
                                } else {
                                    Value::F64(vals.iter().sum::<f64>() / vals.len() as f64)
                                }
                            }
                            ("min", Some(i)) => members.iter().filter_map(|r| as_f64(&r[i])).fold(None, |a: Option<f64>, b| Some(a.map_or(b, |a| a.min(b)))).map(Value::F64).unwrap_or(Value::Null),
                            ("max", Some(i)) => members.iter().filter_map(|r| as_f64(&r[i])).fold(None, |a: Option<f64>, b| Some(a.map_or(b, |a| a.max(b)))).map(Value::F64).unwrap_or(Value::Null),
                            _ => Value::Null,
                        };
                        out.push(value);
                    }
                    rows.push(out);
                }
                Ok(Frame { schema, rows })
            }

            Plan::Formula { input, columns } => {
                let mut frame = input.execute()?;
                for fc in columns {
                    if let Some(idx) = frame.column_index(&fc.name) {
                        for row in &mut frame.rows {
                            row[idx] = evaluate_formula(&fc.expression, row, &frame.schema);
                        }
                    } else {
                        frame.schema.push(crate::types::Column::new(fc.name.clone(), fc.data_type.clone(), true));
                        let computed: Vec<Value> = frame.rows.iter().map(|row| evaluate_formula(&fc.expression, row, &frame.schema)).collect();
                        for (row, value) in frame.rows.iter_mut().zip(computed) {
                            row.push(value);
                        }
                    }
                }
                Ok(frame)
            }

            Plan::RecordId { input, output_column, offset } => {
                let mut frame = input.execute()?;
                frame.schema.push(crate::types::Column::new(output_column.clone(), crate::types::DataType::Int64, false));
                for (i, row) in frame.rows.iter_mut().enumerate() {
                    row.push(Value::I64(*offset + i as i64));
                }
                Ok(frame)
            }
        }
    }
}

fn as_f64(v: &Value) -> Option<f64> {
    match v {
        Value::I64(n) => Some(*n as f64),
        Value::F64(n) => Some(*n),
        _ => None,
    }
}

/// Formula evaluation is deliberately trivial: a bare column reference or a
/// numeric literal. The catalog's `polars_code` kind is where genuinely
/// arbitrary expressions belong (§4.2); `formula` nodes in this runtime
/// exist to demonstrate schema-vs-execution plumbing, not to be a DSL.
fn evaluate_formula(expression: &str, row: &Row, schema: &Schema) -> Value {
    let expr = expression.trim();
    if let Some(idx) = schema.0.iter().position(|c| c.name == expr) {
        return row[idx].clone();
    }
    if let Ok(n) = expr.parse::<i64>() {
        return Value::I64(n);
    }
    if let Ok(n) = expr.parse::<f64>() {
        return Value::F64(n);
    }
    Value::Str(expr.to_string())
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum CompareOp {
    Gt,
    Lt,
    Ge,
    Le,
    Eq,
}

fn column_in_predicate(predicate: &str) -> Option<String> {
    for op in ["==", ">=", "<=", ">", "<"] {
        if let Some((lhs, _)) = predicate.split_once(op) {
            return Some(lhs.trim().to_string());
        }
    }
    None
}

fn parse_comparison(predicate: &str) -> Option<(CompareOp, String)> {
    for (token, op) in [("==", CompareOp::Eq), (">=", CompareOp::Ge), ("<=", CompareOp::Le), (">", CompareOp::Gt), ("<", CompareOp::Lt)] {
        if let Some((_, rhs)) = predicate.split_once(token) {
            return Some((op, rhs.trim().to_string()));
        }
    }
    None
}

fn evaluate_comparison(value: &Value, op: CompareOp, rhs: &str) -> bool {
    let lhs = as_f64(value);
    let rhs_num = rhs.parse::<f64>().ok();
    if let (Some(l), Some(r)) = (lhs, rhs_num) {
        return match op {
            CompareOp::Gt => l > r,
            CompareOp::Lt => l < r,
            CompareOp::Ge => l >= r,
            CompareOp::Le => l <= r,
            CompareOp::Eq => (l - r).abs() < f64::EPSILON,
        };
    }
    let lhs_str = value.to_string();
    let rhs_str = rhs.trim_matches('\'').trim_matches('"');
    match op {
        CompareOp::Eq => lhs_str == rhs_str,
        _ => false,
    }
}

fn compare_values(a: &Value, b: &Value) -> std::cmp::Ordering {
    match (as_f64(a), as_f64(b)) {
        (Some(x), Some(y)) => x.partial_cmp(&y).unwrap_or(std::cmp::Ordering::Equal),
        _ => a.to_string().cmp(&b.to_string()),
    }
}

/// Number of rows a `read` node stands in for source data that this
/// runtime never actually fetches from `path` (§2 Non-goals: no real file
/// I/O or external connectors).
const SYNTHETIC_SOURCE_ROWS: i64 = 5;

/// Materializes a `read` node's declared `columns` into a small, deterministic
/// frame so downstream operators can resolve every column by name instead of
/// failing against an empty schema. Values are derived from the row index so
/// comparisons and sorts over them are demonstrable (e.g. `value > 10`
/// matches some rows and not others).
fn synthetic_source(columns: &[crate::types::Column]) -> Frame {
    let schema = Schema::new(columns.to_vec());
    let rows = (0..SYNTHETIC_SOURCE_ROWS)
        .map(|i| columns.iter().map(|c| synthetic_value(&c.data_type, i)).collect())
        .collect();
    Frame { schema, rows }
}

fn synthetic_value(data_type: &crate::types::DataType, row_index: i64) -> Value {
    use crate::types::DataType;
    match data_type {
        DataType::Int8 | DataType::Int16 | DataType::Int32 | DataType::Int64 => Value::I64(row_index + 1),
        DataType::UInt8 | DataType::UInt16 | DataType::UInt32 | DataType::UInt64 => Value::I64(row_index + 1),
        DataType::Float32 | DataType::Float64 => Value::F64((row_index + 1) as f64 * 10.0),
        DataType::Boolean => Value::Bool(row_index % 2 == 0),
        DataType::String => Value::Str(format!("row{}", row_index + 1)),
        DataType::Date | DataType::Time | DataType::Datetime | DataType::Duration => Value::I64(row_index),
        DataType::List(_) | DataType::Struct(_) | DataType::Null | DataType::Unknown => Value::Null,
    }
}

/// Builds the kind-specific node of a lazy plan from predecessor plans
/// (`build_plan`, §4.2). `PolarsCode`, `Pivot`, `Unpivot`, `TextToRows`,
/// `GraphSolver`, `FuzzyMatch`, `Write`, and `Explore` are accepted by the
/// catalog for schema prediction but have no operator in this minimal
/// runtime; they execute as a passthrough of their first input, which is
/// sufficient for the scheduling and caching properties this crate is
/// actually tested against (§8).
pub fn build_plan(settings: &NodeSettings, mut inputs: Vec<Plan>) -> Plan {
    match settings {
        NodeSettings::Read { columns, .. } => Plan::Source(Box::new(synthetic_source(columns))),
        NodeSettings::Filter { predicate } => Plan::Filter { input: Box::new(inputs.remove(0)), predicate: predicate.clone() },
        NodeSettings::Select { columns } => Plan::Select { input: Box::new(inputs.remove(0)), columns: columns.clone() },
        NodeSettings::Sort { keys } => Plan::Sort {
            input: Box::new(inputs.remove(0)),
            keys: keys.iter().map(|k| (k.column.clone(), k.direction)).collect(),
        },
        NodeSettings::Unique { subset, keep_first } => Plan::Unique { input: Box::new(inputs.remove(0)), subset: subset.clone(), keep_first: *keep_first },
        NodeSettings::Sample { n, seed } => Plan::Sample { input: Box::new(inputs.remove(0)), n: *n, seed: *seed },
        NodeSettings::Join { how, on, right_suffix } => {
            let right = inputs.remove(1);
            let left = inputs.remove(0);
            Plan::Join { left: Box::new(left), right: Box::new(right), how: *how, on: on.clone(), right_suffix: right_suffix.clone() }
        }
        NodeSettings::CrossJoin { left_suffix, right_suffix } => {
            let right = inputs.remove(1);
            let left = inputs.remove(0);
            Plan::CrossJoin { left: Box::new(left), right: Box::new(right), left_suffix: left_suffix.clone(), right_suffix: right_suffix.clone() }
        }
        NodeSettings::Union { .. } => Plan::Union { inputs },
        NodeSettings::GroupBy { group_by, aggregations } => Plan::GroupBy { input: Box::new(inputs.remove(0)), group_by: group_by.clone(), aggregations: aggregations.clone() },
        NodeSettings::Formula { columns } => Plan::Formula { input: Box::new(inputs.remove(0)), columns: columns.clone() },
        NodeSettings::RecordId { output_column, offset } => Plan::RecordId { input: Box::new(inputs.remove(0)), output_column: output_column.clone(), offset: *offset },
        _ => inputs.into_iter().next().unwrap_or_else(|| Plan::Source(Box::new(Frame::default()))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Column, DataType};

    fn frame() -> Frame {
        Frame {
            schema: Schema::new(vec![Column::new("id", DataType::Int64, false), Column::new("value", DataType::Float64, false)]),
            rows: vec![
                vec![Value::I64(1), Value::F64(5.0)],
                vec![Value::I64(2), Value::F64(15.0)],
                vec![Value::I64(3), Value::F64(25.0)],
            ],
        }
    }

    #[test]
    fn filter_then_sort_matches_scenario_one() {
        let plan = Plan::Sort {
            input: Box::new(Plan::Filter { input: Box::new(Plan::Source(Box::new(frame()))), predicate: "value > 10".into() }),
            keys: vec![("value".into(), SortDirection::Desc)],
        };
        let out = plan.execute().unwrap();
        assert_eq!(out.row_count(), 2);
        assert_eq!(out.rows[0][0], Value::I64(3));
    }

    #[test]
    fn inner_join_suffixes_duplicate_columns() {
        let left = Frame { schema: Schema::new(vec![Column::new("k", DataType::Int64, false), Column::new("v", DataType::Int64, false)]), rows: vec![vec![Value::I64(1), Value::I64(10)]] };
        let right = Frame { schema: Schema::new(vec![Column::new("k", DataType::Int64, false), Column::new("v", DataType::Int64, false)]), rows: vec![vec![Value::I64(1), Value::I64(20)]] };
        let plan = Plan::Join {
            left: Box::new(Plan::Source(Box::new(left))),
            right: Box::new(Plan::Source(Box::new(right))),
            how: JoinHow::Inner,
            on: vec!["k".into()],
            right_suffix: "_right".into(),
        };
        let out = plan.execute().unwrap();
        assert_eq!(out.schema.names(), vec!["k", "v", "v_right"]);
        assert_eq!(out.row_count(), 1);
    }

    #[test]
    fn sample_is_deterministic_given_a_seed() {
        let plan_a = Plan::Sample { input: Box::new(Plan::Source(Box::new(frame()))), n: 2, seed: Some(42) };
        let plan_b = Plan::Sample { input: Box::new(Plan::Source(Box::new(frame()))), n: 2, seed: Some(42) };
        assert_eq!(plan_a.execute().unwrap().rows, plan_b.execute().unwrap().rows);
    }
}
