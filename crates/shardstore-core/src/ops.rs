//! JSQL operations
//!
//! Pure functions over owned datasets. A cursor folds its program through
//! these left to right; none of them touch a backing store.

use crate::query::{compare_values, Predicate};
use crate::{CoreError, Record, Result};
use serde_json::{Number, Value};
use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};

/// Joins the per-field components of a sort/distinct key
pub const KEY_SEPARATOR: char = '\u{0}';

/// Follows a `KEY_SEPARATOR` occurring inside a component; sorts above every
/// type tag
const ESCAPE_MARK: char = '\u{7f}';

/// Build the joined key of `fields` for `record`.
///
/// Each component carries a type tag so that plain lexicographic comparison
/// of two keys orders missing < null < bool < number < string < composite,
/// with numbers in numeric order. Separators inside text are escaped, so the
/// separator is the smallest character of any key.
pub fn sort_key(record: &Record, fields: &[String]) -> String {
    let mut key = String::new();
    for (i, field) in fields.iter().enumerate() {
        if i > 0 {
            key.push(KEY_SEPARATOR);
        }
        push_component(&mut key, record.get(field));
    }
    key
}

fn push_component(key: &mut String, value: Option<&Value>) {
    match value {
        None => {}
        Some(Value::Null) => key.push('a'),
        Some(Value::Bool(flag)) => key.push_str(if *flag { "b1" } else { "b0" }),
        Some(Value::Number(number)) => {
            key.push('n');
            key.push_str(&encode_number(number));
        }
        Some(Value::String(text)) => {
            key.push('s');
            push_escaped(key, text);
        }
        Some(composite) => {
            key.push('z');
            push_escaped(key, &composite.to_string());
        }
    }
}

fn push_escaped(key: &mut String, text: &str) {
    for c in text.chars() {
        key.push(c);
        if c == KEY_SEPARATOR {
            key.push(ESCAPE_MARK);
        }
    }
}

/// Order-preserving fixed-width hex encoding of a JSON number
fn encode_number(number: &Number) -> String {
    let mut float = number.as_f64().unwrap_or(0.0);
    if float == 0.0 {
        // fold -0.0 into 0.0
        float = 0.0;
    }
    let bits = float.to_bits();
    let ordered = if bits >> 63 == 1 { !bits } else { bits | (1 << 63) };
    format!("{:016x}", ordered)
}

/// Keep records matching every clause
pub fn select(records: Vec<Record>, predicate: &Predicate) -> Vec<Record> {
    records
        .into_iter()
        .filter(|record| predicate.matches(record))
        .collect()
}

/// Keep only `fields`; missing fields become explicit nulls
pub fn projection(records: Vec<Record>, fields: &[String]) -> Vec<Record> {
    records
        .into_iter()
        .map(|record| {
            fields.iter().fold(Record::new(), |projected, field| {
                let value = record.get(field).cloned().unwrap_or(Value::Null);
                projected.with(field.clone(), value)
            })
        })
        .collect()
}

/// Stable ascending sort on the joined key
pub fn order(records: Vec<Record>, fields: &[String]) -> Vec<Record> {
    sort_by_key(records, fields, Ordering::Less)
}

/// Stable descending sort on the joined key
pub fn desc(records: Vec<Record>, fields: &[String]) -> Vec<Record> {
    sort_by_key(records, fields, Ordering::Greater)
}

fn sort_by_key(records: Vec<Record>, fields: &[String], direction: Ordering) -> Vec<Record> {
    let mut keyed: Vec<(String, Record)> = records
        .into_iter()
        .map(|record| (sort_key(&record, fields), record))
        .collect();
    keyed.sort_by(|(a, _), (b, _)| match direction {
        Ordering::Greater => b.cmp(a),
        _ => a.cmp(b),
    });
    keyed.into_iter().map(|(_, record)| record).collect()
}

/// First-occurrence-wins dedup on the joined key of `fields`, or of all keys
/// of the first record (sorted) when `fields` is `None`.
pub fn distinct(records: Vec<Record>, fields: Option<&[String]>) -> Vec<Record> {
    let fields: Vec<String> = match fields {
        Some(fields) => fields.to_vec(),
        None => match records.first() {
            Some(first) => {
                let mut keys: Vec<String> = first.keys().cloned().collect();
                keys.sort();
                keys
            }
            None => return records,
        },
    };

    let mut seen = HashSet::new();
    records
        .into_iter()
        .filter(|record| seen.insert(sort_key(record, &fields)))
        .collect()
}

pub fn limit(mut records: Vec<Record>, n: usize) -> Vec<Record> {
    records.truncate(n);
    records
}

/// The first record only
pub fn one(records: Vec<Record>) -> Vec<Record> {
    limit(records, 1)
}

/// The record at `index` only
pub fn row(records: Vec<Record>, index: usize) -> Vec<Record> {
    records.into_iter().nth(index).into_iter().collect()
}

/// Every record reduced to `{field: value}`
pub fn col(records: Vec<Record>, field: &str) -> Vec<Record> {
    projection(records, &[field.to_string()])
}

fn ids(records: &[Record]) -> HashSet<u64> {
    records.iter().filter_map(Record::id).collect()
}

/// Records of `a` then `b`, without repeating an id
pub fn union(a: Vec<Record>, b: Vec<Record>) -> Vec<Record> {
    let mut seen = HashSet::new();
    a.into_iter()
        .chain(b)
        .filter(|record| match record.id() {
            Some(id) => seen.insert(id),
            None => true,
        })
        .collect()
}

/// Records of `a` whose id also appears in `b`
pub fn intersection(a: Vec<Record>, b: Vec<Record>) -> Vec<Record> {
    let other = ids(&b);
    a.into_iter()
        .filter(|record| record.id().is_some_and(|id| other.contains(&id)))
        .collect()
}

/// Records of `a` whose id does not appear in `b`
pub fn difference(a: Vec<Record>, b: Vec<Record>) -> Vec<Record> {
    let other = ids(&b);
    a.into_iter()
        .filter(|record| !record.id().is_some_and(|id| other.contains(&id)))
        .collect()
}

/// `difference(b, a)`
pub fn complement(a: Vec<Record>, b: Vec<Record>) -> Vec<Record> {
    difference(b, a)
}

/// Terminal aggregates a cursor source may support
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Aggregate {
    Count,
    Sum,
    Avg,
    Min,
    Max,
    Median,
    Mode,
}

impl Aggregate {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Count => "count",
            Self::Sum => "sum",
            Self::Avg => "avg",
            Self::Min => "min",
            Self::Max => "max",
            Self::Median => "median",
            Self::Mode => "mode",
        }
    }
}

/// Compute an aggregate over a materialized dataset.
///
/// `Count` without a field counts records; every other aggregate needs a
/// field and ignores records where it is missing or null. `avg`, `min`,
/// `max`, `median` and `mode` of nothing are `null`.
pub fn aggregate(records: &[Record], kind: Aggregate, field: Option<&str>) -> Result<Value> {
    let values: Vec<&Value> = match field {
        Some(field) => records
            .iter()
            .filter_map(|record| record.get(field))
            .filter(|value| !value.is_null())
            .collect(),
        None if kind == Aggregate::Count => return Ok(Value::from(records.len())),
        None => {
            return Err(CoreError::Validation(format!(
                "{} requires a field",
                kind.name()
            )))
        }
    };

    let numbers = || values.iter().filter_map(|value| value.as_f64()).collect::<Vec<f64>>();

    let result = match kind {
        Aggregate::Count => Value::from(values.len()),
        Aggregate::Sum => {
            if values.iter().all(|value| value.is_i64()) {
                values
                    .iter()
                    .filter_map(|value| value.as_i64())
                    .try_fold(0i64, i64::checked_add)
                    .map(Value::from)
                    .unwrap_or_else(|| float(numbers().iter().sum()))
            } else {
                float(numbers().iter().sum())
            }
        }
        Aggregate::Avg => {
            let numbers = numbers();
            if numbers.is_empty() {
                Value::Null
            } else {
                float(numbers.iter().sum::<f64>() / numbers.len() as f64)
            }
        }
        Aggregate::Min => extreme(&values, Ordering::Less),
        Aggregate::Max => extreme(&values, Ordering::Greater),
        Aggregate::Median => {
            let mut numbers = numbers();
            numbers.sort_by(|a, b| a.partial_cmp(b).unwrap_or(Ordering::Equal));
            match numbers.len() {
                0 => Value::Null,
                n if n % 2 == 1 => float(numbers[n / 2]),
                n => float((numbers[n / 2 - 1] + numbers[n / 2]) / 2.0),
            }
        }
        Aggregate::Mode => {
            let mut counts: HashMap<String, (usize, usize)> = HashMap::new();
            for (position, value) in values.iter().enumerate() {
                let mut key = String::new();
                push_component(&mut key, Some(value));
                counts.entry(key).or_insert((0, position)).0 += 1;
            }
            counts
                .values()
                .max_by(|(count_a, first_a), (count_b, first_b)| {
                    count_a.cmp(count_b).then(first_b.cmp(first_a))
                })
                .map(|(_, first)| values[*first].clone())
                .unwrap_or(Value::Null)
        }
    };
    Ok(result)
}

fn extreme(values: &[&Value], wanted: Ordering) -> Value {
    let mut best: Option<&Value> = None;
    for &value in values {
        best = match best {
            None => Some(value),
            Some(current) if compare_values(value, current) == Some(wanted) => Some(value),
            keep => keep,
        };
    }
    best.cloned().unwrap_or(Value::Null)
}

fn float(value: f64) -> Value {
    Number::from_f64(value).map(Value::Number).unwrap_or(Value::Null)
}
