//! Transform step pipeline: map, filter, reduce, sort, group, join, extract.
//!
//! Every operation is synchronous and works on JSON values. Array
//! operations reject non-array input with a step error.

use std::cmp::Ordering;
use std::collections::HashMap;

use flowrun_types::flow::{ReduceOperation, SortOrder, TransformOperation};
use serde_json::{Map, Number, Value};

use super::error::StepError;
use super::expression;
use super::resolver::{self, Scoped, Variables};

/// Run `operations` in order over `input`.
pub fn apply_pipeline(
    input: Value,
    operations: &[TransformOperation],
    vars: &dyn Variables,
) -> Result<Value, StepError> {
    operations
        .iter()
        .try_fold(input, |current, op| apply_operation(current, op, vars))
}

fn apply_operation(
    current: Value,
    op: &TransformOperation,
    vars: &dyn Variables,
) -> Result<Value, StepError> {
    match op {
        TransformOperation::Map { field } => {
            let items = expect_array(current, "map")?;
            Ok(Value::Array(
                items
                    .iter()
                    .map(|item| resolver::get_path(item, field).cloned().unwrap_or(Value::Null))
                    .collect(),
            ))
        }
        TransformOperation::Filter { condition } => {
            let items = expect_array(current, "filter")?;
            let mut kept = Vec::with_capacity(items.len());
            for (index, item) in items.into_iter().enumerate() {
                let mut locals = HashMap::with_capacity(2);
                locals.insert("item".to_string(), item);
                locals.insert("index".to_string(), Value::from(index));
                let scoped = Scoped { locals: &locals, parent: vars };
                if expression::evaluate(condition, &scoped)? {
                    if let Some(item) = locals.remove("item") {
                        kept.push(item);
                    }
                }
            }
            Ok(Value::Array(kept))
        }
        TransformOperation::Reduce { operation, field } => {
            let items = expect_array(current, "reduce")?;
            let values: Vec<Value> = match field {
                Some(field) => items
                    .iter()
                    .filter_map(|item| resolver::get_path(item, field).cloned())
                    .collect(),
                None => items,
            };
            Ok(reduce(*operation, &values))
        }
        TransformOperation::Sort { field, order } => {
            let mut items = expect_array(current, "sort")?;
            items.sort_by(|a, b| {
                let (ka, kb) = match field {
                    Some(f) => (resolver::get_path(a, f), resolver::get_path(b, f)),
                    None => (Some(a), Some(b)),
                };
                let ordering = compare_values(ka, kb);
                match order {
                    SortOrder::Asc => ordering,
                    SortOrder::Desc => ordering.reverse(),
                }
            });
            Ok(Value::Array(items))
        }
        TransformOperation::Group { field } => {
            let items = expect_array(current, "group")?;
            let mut groups: Map<String, Value> = Map::new();
            for item in items {
                let key = resolver::get_path(&item, field)
                    .map(resolver::value_to_string)
                    .unwrap_or_else(|| "null".to_string());
                if let Value::Array(bucket) = groups.entry(key).or_insert_with(|| Value::Array(Vec::new())) {
                    bucket.push(item);
                }
            }
            Ok(Value::Object(groups))
        }
        TransformOperation::Join { separator } => {
            let items = expect_array(current, "join")?;
            let parts: Vec<String> = items.iter().map(resolver::value_to_string).collect();
            Ok(Value::String(parts.join(separator)))
        }
        TransformOperation::Extract { path } => Ok(resolver::get_path(&current, path)
            .cloned()
            .unwrap_or(Value::Null)),
    }
}

fn expect_array(value: Value, op: &str) -> Result<Vec<Value>, StepError> {
    match value {
        Value::Array(items) => Ok(items),
        other => Err(StepError::Transform(format!(
            "{op} requires an array input, got {}",
            type_name(&other)
        ))),
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn numeric(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok().filter(|f| f.is_finite()),
        _ => None,
    }
}

fn number_value(f: f64) -> Value {
    if f.fract() == 0.0 && f.abs() < i64::MAX as f64 {
        Value::Number(Number::from(f as i64))
    } else {
        Number::from_f64(f).map(Value::Number).unwrap_or(Value::Null)
    }
}

fn reduce(operation: ReduceOperation, values: &[Value]) -> Value {
    let nums = || values.iter().filter_map(numeric);
    match operation {
        ReduceOperation::Count => Value::from(values.len()),
        ReduceOperation::Sum => number_value(nums().sum()),
        ReduceOperation::Min => nums().reduce(f64::min).map(number_value).unwrap_or(Value::Null),
        ReduceOperation::Max => nums().reduce(f64::max).map(number_value).unwrap_or(Value::Null),
        ReduceOperation::Avg => {
            let (sum, count) = nums().fold((0.0, 0usize), |(s, c), n| (s + n, c + 1));
            if count == 0 {
                Value::Null
            } else {
                number_value(sum / count as f64)
            }
        }
        ReduceOperation::Concat => {
            if !values.is_empty() && values.iter().all(Value::is_array) {
                Value::Array(
                    values
                        .iter()
                        .filter_map(Value::as_array)
                        .flatten()
                        .cloned()
                        .collect(),
                )
            } else {
                Value::String(values.iter().map(resolver::value_to_string).collect())
            }
        }
    }
}

fn compare_values(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    match (a, b) {
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Less,
        (Some(_), None) => Ordering::Greater,
        (Some(a), Some(b)) => match (numeric(a), numeric(b)) {
            (Some(x), Some(y)) => x.partial_cmp(&y).unwrap_or(Ordering::Equal),
            _ => resolver::value_to_string(a).cmp(&resolver::value_to_string(b)),
        },
    }
}
