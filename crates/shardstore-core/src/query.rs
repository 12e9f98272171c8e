//! Structural queries and condition strings
//!
//! A query is a flat map of `field -> literal | "op operand"`. Condition
//! strings start with one of `=`, `!`, `<`, `>`, `<=`, `>=` (default `=`);
//! all fields are ANDed.

use crate::{CoreError, Record, Result, CATEGORY_FIELD};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::cmp::Ordering;
use std::fmt;

/// Comparison operator of a condition
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Operator {
    Eq,
    Ne,
    Lt,
    Gt,
    Le,
    Ge,
}

impl Operator {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Eq => "=",
            Self::Ne => "!",
            Self::Lt => "<",
            Self::Gt => ">",
            Self::Le => "<=",
            Self::Ge => ">=",
        }
    }

    fn accepts(&self, ordering: Option<Ordering>) -> bool {
        match self {
            Self::Eq => ordering == Some(Ordering::Equal),
            Self::Ne => ordering != Some(Ordering::Equal),
            Self::Lt => ordering == Some(Ordering::Less),
            Self::Gt => ordering == Some(Ordering::Greater),
            Self::Le => matches!(ordering, Some(Ordering::Less | Ordering::Equal)),
            Self::Ge => matches!(ordering, Some(Ordering::Greater | Ordering::Equal)),
        }
    }
}

/// A parsed `(operator, operand)` pair
#[derive(Clone, Debug, PartialEq)]
pub struct Condition {
    pub operator: Operator,
    pub operand: Value,
}

impl Condition {
    pub fn new(operator: Operator, operand: impl Into<Value>) -> Self {
        Self {
            operator,
            operand: operand.into(),
        }
    }

    /// Parse a condition string such as `"<1500"` or `"Tom"`
    pub fn parse(raw: &str) -> Result<Self> {
        let text = raw.trim_start();
        // two-character operators must be tried first
        let (operator, rest) = if let Some(rest) = text.strip_prefix("<=") {
            (Some(Operator::Le), rest)
        } else if let Some(rest) = text.strip_prefix(">=") {
            (Some(Operator::Ge), rest)
        } else if let Some(rest) = text.strip_prefix('=') {
            (Some(Operator::Eq), rest)
        } else if let Some(rest) = text.strip_prefix('!') {
            (Some(Operator::Ne), rest)
        } else if let Some(rest) = text.strip_prefix('<') {
            (Some(Operator::Lt), rest)
        } else if let Some(rest) = text.strip_prefix('>') {
            (Some(Operator::Gt), rest)
        } else {
            (None, text)
        };

        let operand = rest.trim();
        match operator {
            Some(op) if operand.is_empty() => Err(CoreError::Validation(format!(
                "condition {:?} has operator '{}' but no operand",
                raw,
                op.as_str()
            ))),
            Some(op) => Ok(Self::new(op, parse_operand(operand))),
            None => Ok(Self::new(Operator::Eq, parse_operand(operand))),
        }
    }

    /// Interpret a query value: strings are condition strings, anything else
    /// is an equality literal.
    pub fn from_value(value: &Value) -> Result<Self> {
        match value {
            Value::String(raw) => Self::parse(raw),
            literal => Ok(Self::new(Operator::Eq, literal.clone())),
        }
    }

    /// Test a field value; a missing field only satisfies `!`
    pub fn matches(&self, value: Option<&Value>) -> bool {
        match value {
            None => self.operator == Operator::Ne,
            Some(value) => self.operator.accepts(compare_values(value, &self.operand)),
        }
    }
}

impl fmt::Display for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.operator.as_str(), self.operand)
    }
}

fn parse_operand(text: &str) -> Value {
    match serde_json::from_str::<Value>(text) {
        Ok(value @ (Value::Number(_) | Value::Bool(_) | Value::Null | Value::String(_))) => value,
        _ => Value::String(text.to_string()),
    }
}

/// Order two JSON values the way conditions and aggregates see them.
///
/// Numbers compare numerically, strings lexicographically, and a numeric
/// string compares against a number by value. Unrelated types are unordered
/// unless structurally equal.
pub fn compare_values(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64()?.partial_cmp(&y.as_f64()?),
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        (Value::Number(x), Value::String(y)) => x.as_f64()?.partial_cmp(&y.trim().parse::<f64>().ok()?),
        (Value::String(x), Value::Number(y)) => x.trim().parse::<f64>().ok()?.partial_cmp(&y.as_f64()?),
        (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
        (x, y) if x == y => Some(Ordering::Equal),
        _ => None,
    }
}

/// A structural query as sent over the wire: `field -> literal | condition`
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Query(Map<String, Value>);

impl Query {
    /// The empty query, matching every record
    pub fn new() -> Self {
        Self(Map::new())
    }

    /// Builder-style clause setter
    pub fn with(mut self, field: impl Into<String>, condition: impl Into<Value>) -> Self {
        self.0.insert(field.into(), condition.into());
        self
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.0.get(field)
    }

    pub fn fields(&self) -> impl Iterator<Item = &String> {
        self.0.keys()
    }

    /// Category named by an equality clause, used to narrow category-scoped
    /// backends before the predicate runs.
    pub fn category(&self) -> Option<String> {
        let condition = Condition::from_value(self.0.get(CATEGORY_FIELD)?).ok()?;
        match (condition.operator, condition.operand) {
            (Operator::Eq, Value::String(category)) => Some(category),
            _ => None,
        }
    }

    /// Parse every clause
    pub fn predicate(&self) -> Result<Predicate> {
        let clauses = self
            .0
            .iter()
            .map(|(field, value)| Ok((field.clone(), Condition::from_value(value)?)))
            .collect::<Result<Vec<_>>>()?;
        Ok(Predicate { clauses })
    }

    pub fn matches(&self, record: &Record) -> Result<bool> {
        Ok(self.predicate()?.matches(record))
    }
}

impl From<Map<String, Value>> for Query {
    fn from(map: Map<String, Value>) -> Self {
        Self(map)
    }
}

impl TryFrom<Value> for Query {
    type Error = CoreError;

    fn try_from(value: Value) -> Result<Self> {
        match value {
            Value::Object(map) => Ok(Self(map)),
            other => Err(CoreError::Validation(format!(
                "query must be a JSON object, got {}",
                other
            ))),
        }
    }
}

/// A compiled query: ANDed field conditions
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Predicate {
    clauses: Vec<(String, Condition)>,
}

impl Predicate {
    pub fn clauses(&self) -> &[(String, Condition)] {
        &self.clauses
    }

    pub fn matches(&self, record: &Record) -> bool {
        self.clauses
            .iter()
            .all(|(field, condition)| condition.matches(record.get(field)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use serde_json::json;

    #[rstest]
    #[case("<1500", Operator::Lt, json!(1500))]
    #[case("<=1500", Operator::Le, json!(1500))]
    #[case(">= 3", Operator::Ge, json!(3))]
    #[case(">x", Operator::Gt, json!("x"))]
    #[case("!Tom", Operator::Ne, json!("Tom"))]
    #[case("=Tom", Operator::Eq, json!("Tom"))]
    #[case("Tom", Operator::Eq, json!("Tom"))]
    #[case("true", Operator::Eq, json!(true))]
    #[case("!null", Operator::Ne, json!(null))]
    #[case("= \"quoted\"", Operator::Eq, json!("quoted"))]
    #[case("", Operator::Eq, json!(""))]
    fn test_parse_condition(#[case] raw: &str, #[case] operator: Operator, #[case] operand: Value) {
        let condition = Condition::parse(raw).unwrap();
        assert_eq!(condition.operator, operator);
        assert_eq!(condition.operand, operand);
    }

    #[rstest]
    #[case("<")]
    #[case(">=  ")]
    #[case("!")]
    fn test_operator_without_operand_is_invalid(#[case] raw: &str) {
        assert!(matches!(Condition::parse(raw), Err(CoreError::Validation(_))));
    }

    #[test]
    fn test_condition_matching() {
        let lt = Condition::parse("<1500").unwrap();
        assert!(lt.matches(Some(&json!(1452))));
        assert!(!lt.matches(Some(&json!(1500))));
        assert!(lt.matches(Some(&json!("1265"))));
        assert!(!lt.matches(None));

        let ne = Condition::parse("!Tom").unwrap();
        assert!(ne.matches(None));
        assert!(ne.matches(Some(&json!("Ann"))));
        assert!(!ne.matches(Some(&json!("Tom"))));
    }

    #[test]
    fn test_literal_values_mean_equality() {
        let query = Query::new().with("age", 42).with("tags", json!(["a"]));
        let predicate = query.predicate().unwrap();
        let hit = Record::try_from(json!({"age": 42, "tags": ["a"]})).unwrap();
        let miss = Record::try_from(json!({"age": 41, "tags": ["a"]})).unwrap();
        assert!(predicate.matches(&hit));
        assert!(!predicate.matches(&miss));
    }

    #[test]
    fn test_fields_are_anded() {
        let query = Query::new().with("born", ">1200").with("name", "!Dante");
        let dante = Record::try_from(json!({"name": "Dante", "born": 1265})).unwrap();
        let leo = Record::try_from(json!({"name": "Leonardo", "born": 1452})).unwrap();
        assert!(!query.matches(&dante).unwrap());
        assert!(query.matches(&leo).unwrap());
    }

    #[test]
    fn test_category_pushdown_only_for_equality() {
        assert_eq!(Query::new().with("category", "people").category().as_deref(), Some("people"));
        assert_eq!(Query::new().with("category", "=people").category().as_deref(), Some("people"));
        assert_eq!(Query::new().with("category", "!people").category(), None);
        assert_eq!(Query::new().category(), None);
    }
}
