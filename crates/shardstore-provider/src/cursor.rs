//! Lazy query cursors
//!
//! A cursor is a program of [`Operation`]s over a [`Source`]. Builder calls
//! only append to the program; nothing runs until [`Cursor::fetch`], an
//! aggregate, or [`Cursor::next`]. The program is consumed by the first
//! materialization whether it succeeds or not.

use crate::document::DocumentScan;
use crate::remote::RemoteScan;
use crate::{ProviderError, Result};
use dashmap::DashMap;
use futures::future::BoxFuture;
use serde_json::Value;
use shardstore_core::ops::{self, Aggregate};
use shardstore_core::{Query, Record};
use std::cmp::Ordering;
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use tracing::trace;

/// Deferred base dataset of a postponed source
pub type Loader = Arc<dyn Fn() -> BoxFuture<'static, Result<Vec<Record>>> + Send + Sync>;

/// Caller-supplied record transform
pub type MapFn = Arc<dyn Fn(Record) -> Record + Send + Sync>;

/// Caller-supplied record filter
pub type FilterFn = Arc<dyn Fn(&Record) -> bool + Send + Sync>;

/// Caller-supplied comparator
pub type SortFn = Arc<dyn Fn(&Record, &Record) -> Ordering + Send + Sync>;

/// One step of a cursor program
#[derive(Clone)]
pub enum Operation {
    Select(Query),
    Projection(Vec<String>),
    Order(Vec<String>),
    Desc(Vec<String>),
    Distinct(Option<Vec<String>>),
    Limit(usize),
    One,
    Row(usize),
    Col(String),
    Union(Vec<Record>),
    Intersection(Vec<Record>),
    Difference(Vec<Record>),
    Complement(Vec<Record>),
    Map(MapFn),
    Filter(FilterFn),
    Sort(SortFn),
}

impl Operation {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Select(_) => "select",
            Self::Projection(_) => "projection",
            Self::Order(_) => "order",
            Self::Desc(_) => "desc",
            Self::Distinct(_) => "distinct",
            Self::Limit(_) => "limit",
            Self::One => "one",
            Self::Row(_) => "row",
            Self::Col(_) => "col",
            Self::Union(_) => "union",
            Self::Intersection(_) => "intersection",
            Self::Difference(_) => "difference",
            Self::Complement(_) => "complement",
            Self::Map(_) => "map",
            Self::Filter(_) => "filter",
            Self::Sort(_) => "sort",
        }
    }

    /// Run this step over an owned dataset
    pub fn apply(self, records: Vec<Record>) -> Result<Vec<Record>> {
        let result = match self {
            Self::Select(query) => ops::select(records, &query.predicate()?),
            Self::Projection(fields) => ops::projection(records, &fields),
            Self::Order(fields) => ops::order(records, &fields),
            Self::Desc(fields) => ops::desc(records, &fields),
            Self::Distinct(fields) => ops::distinct(records, fields.as_deref()),
            Self::Limit(n) => ops::limit(records, n),
            Self::One => ops::one(records),
            Self::Row(index) => ops::row(records, index),
            Self::Col(field) => ops::col(records, &field),
            Self::Union(other) => ops::union(records, other),
            Self::Intersection(other) => ops::intersection(records, other),
            Self::Difference(other) => ops::difference(records, other),
            Self::Complement(other) => ops::complement(records, other),
            Self::Map(f) => records.into_iter().map(|record| f(record)).collect(),
            Self::Filter(f) => records.into_iter().filter(|record| f(record)).collect(),
            Self::Sort(f) => {
                let mut records = records;
                records.sort_by(|a, b| f(a, b));
                records
            }
        };
        Ok(result)
    }
}

impl fmt::Debug for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Select(query) => write!(f, "Select({:?})", query),
            Self::Projection(fields) | Self::Order(fields) | Self::Desc(fields) => {
                write!(f, "{}({:?})", self.name(), fields)
            }
            Self::Distinct(fields) => write!(f, "Distinct({:?})", fields),
            Self::Limit(n) | Self::Row(n) => write!(f, "{}({})", self.name(), n),
            Self::Col(field) => write!(f, "Col({})", field),
            Self::Union(other)
            | Self::Intersection(other)
            | Self::Difference(other)
            | Self::Complement(other) => write!(f, "{}({} records)", self.name(), other.len()),
            Self::One | Self::Map(_) | Self::Filter(_) | Self::Sort(_) => f.write_str(self.name()),
        }
    }
}

/// In-memory base datasets
#[derive(Clone)]
pub enum MemorySource {
    /// Live provider table, snapshotted at fetch time
    Table(Arc<DashMap<u64, Record>>),
    /// Fixed record list
    Records(Vec<Record>),
}

/// Where a cursor's base dataset comes from
pub enum Source {
    Memory(MemorySource),
    Postponed(Loader),
    Document(DocumentScan),
    Remote(RemoteScan),
    /// Result of another cursor
    Child(Box<Cursor>),
}

impl Source {
    fn name(&self) -> &'static str {
        match self {
            Self::Memory(_) => "memory",
            Self::Postponed(_) => "postponed",
            Self::Document(_) => "document",
            Self::Remote(_) => "remote",
            Self::Child(_) => "child",
        }
    }

    /// Whether terminal aggregates of this kind can run here
    pub fn supports(&self, aggregate: Aggregate) -> bool {
        match self {
            Self::Memory(_) => true,
            Self::Document(_) => aggregate == Aggregate::Count,
            Self::Child(parent) => parent.source.supports(aggregate),
            Self::Postponed(_) | Self::Remote(_) => false,
        }
    }

    async fn load(&mut self) -> Result<Vec<Record>> {
        match self {
            Self::Memory(MemorySource::Table(table)) => {
                let mut rows: Vec<(u64, Record)> = table
                    .iter()
                    .map(|entry| (*entry.key(), entry.value().clone()))
                    .collect();
                rows.sort_by_key(|(id, _)| *id);
                Ok(rows.into_iter().map(|(_, record)| record).collect())
            }
            Self::Memory(MemorySource::Records(records)) => Ok(records.clone()),
            Self::Postponed(loader) => loader().await,
            Self::Document(scan) => scan.load().await,
            Self::Remote(scan) => scan.load().await,
            Self::Child(parent) => parent.fetch().await,
        }
    }
}

/// A pending computation over a provider's records
pub struct Cursor {
    source: Source,
    program: Vec<Operation>,
    buffered: Option<VecDeque<Record>>,
}

impl Cursor {
    pub fn new(source: Source) -> Self {
        Self {
            source,
            program: Vec::new(),
            buffered: None,
        }
    }

    /// Cursor over a fixed record list
    pub fn from_records(records: Vec<Record>) -> Self {
        Self::new(Source::Memory(MemorySource::Records(records)))
    }

    /// Cursor over a deferred dataset
    pub fn postponed<F>(loader: F) -> Self
    where
        F: Fn() -> BoxFuture<'static, Result<Vec<Record>>> + Send + Sync + 'static,
    {
        Self::new(Source::Postponed(Arc::new(loader)))
    }

    /// Cursor whose program starts with `query`
    pub fn filtered(source: Source, query: Query) -> Self {
        Self::new(source).matching(query)
    }

    /// Filter in this cursor's own program, without spawning a child
    pub fn matching(self, query: Query) -> Self {
        if query.is_empty() {
            self
        } else {
            self.push(Operation::Select(query))
        }
    }

    pub fn source(&self) -> &Source {
        &self.source
    }

    /// Operations queued and not yet run
    pub fn program(&self) -> &[Operation] {
        &self.program
    }

    fn push(mut self, operation: Operation) -> Self {
        self.program.push(operation);
        self
    }

    /// New cursor filtering the result of this one
    pub fn select(self, query: Query) -> Cursor {
        Cursor::new(Source::Child(Box::new(self))).push(Operation::Select(query))
    }

    pub fn projection<I, S>(self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.push(Operation::Projection(strings(fields)))
    }

    pub fn order<I, S>(self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.push(Operation::Order(strings(fields)))
    }

    pub fn desc<I, S>(self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.push(Operation::Desc(strings(fields)))
    }

    /// Dedup on `fields`; `None` keys on every field of the first record
    pub fn distinct<I, S>(self, fields: Option<I>) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.push(Operation::Distinct(fields.map(strings)))
    }

    pub fn limit(self, n: usize) -> Self {
        self.push(Operation::Limit(n))
    }

    pub fn one(self) -> Self {
        self.push(Operation::One)
    }

    pub fn row(self, index: usize) -> Self {
        self.push(Operation::Row(index))
    }

    pub fn col(self, field: impl Into<String>) -> Self {
        self.push(Operation::Col(field.into()))
    }

    pub fn union(self, other: Vec<Record>) -> Self {
        self.push(Operation::Union(other))
    }

    pub fn intersection(self, other: Vec<Record>) -> Self {
        self.push(Operation::Intersection(other))
    }

    pub fn difference(self, other: Vec<Record>) -> Self {
        self.push(Operation::Difference(other))
    }

    pub fn complement(self, other: Vec<Record>) -> Self {
        self.push(Operation::Complement(other))
    }

    pub fn map<F>(self, f: F) -> Self
    where
        F: Fn(Record) -> Record + Send + Sync + 'static,
    {
        self.push(Operation::Map(Arc::new(f)))
    }

    pub fn filter<F>(self, f: F) -> Self
    where
        F: Fn(&Record) -> bool + Send + Sync + 'static,
    {
        self.push(Operation::Filter(Arc::new(f)))
    }

    pub fn sort<F>(self, f: F) -> Self
    where
        F: Fn(&Record, &Record) -> Ordering + Send + Sync + 'static,
    {
        self.push(Operation::Sort(Arc::new(f)))
    }

    /// Materialize: load the parent or source, then fold the program in
    /// order. The program is cleared even when loading fails.
    pub fn fetch(&mut self) -> BoxFuture<'_, Result<Vec<Record>>> {
        Box::pin(async move {
            let program = std::mem::take(&mut self.program);
            trace!(source = self.source.name(), steps = program.len(), "fetching cursor");
            let base = self.source.load().await?;
            program
                .into_iter()
                .try_fold(base, |records, operation| operation.apply(records))
        })
    }

    /// Next record, materializing on the first call
    pub async fn next(&mut self) -> Result<Option<Record>> {
        if self.buffered.is_none() {
            let records = self.fetch().await?;
            self.buffered = Some(records.into());
        }
        Ok(self.buffered.as_mut().and_then(VecDeque::pop_front))
    }

    pub async fn count(&mut self) -> Result<usize> {
        self.ensure_supported(Aggregate::Count)?;
        Ok(self.fetch().await?.len())
    }

    pub async fn sum(&mut self, field: &str) -> Result<Value> {
        self.aggregate(Aggregate::Sum, field).await
    }

    pub async fn avg(&mut self, field: &str) -> Result<Value> {
        self.aggregate(Aggregate::Avg, field).await
    }

    pub async fn min(&mut self, field: &str) -> Result<Value> {
        self.aggregate(Aggregate::Min, field).await
    }

    pub async fn max(&mut self, field: &str) -> Result<Value> {
        self.aggregate(Aggregate::Max, field).await
    }

    pub async fn median(&mut self, field: &str) -> Result<Value> {
        self.aggregate(Aggregate::Median, field).await
    }

    pub async fn mode(&mut self, field: &str) -> Result<Value> {
        self.aggregate(Aggregate::Mode, field).await
    }

    async fn aggregate(&mut self, kind: Aggregate, field: &str) -> Result<Value> {
        self.ensure_supported(kind)?;
        let records = self.fetch().await?;
        Ok(ops::aggregate(&records, kind, Some(field))?)
    }

    fn ensure_supported(&self, kind: Aggregate) -> Result<()> {
        if self.source.supports(kind) {
            Ok(())
        } else {
            Err(ProviderError::not_implemented(format!(
                "{} on a {} cursor",
                kind.name(),
                self.source.name()
            )))
        }
    }
}

impl fmt::Debug for Cursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cursor")
            .field("source", &self.source.name())
            .field("program", &self.program)
            .finish()
    }
}

fn strings<I, S>(fields: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    fields.into_iter().map(Into::into).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};

    fn people() -> Vec<Record> {
        [
            json!({"id": 1, "name": "Leonardo", "born": 1452}),
            json!({"id": 2, "name": "Newton", "born": 1643}),
            json!({"id": 3, "name": "Dante", "born": 1265}),
            json!({"id": 4, "name": "Al-Khwarizmi", "born": 780}),
            json!({"id": 5, "name": "Curie", "born": 1867}),
        ]
        .into_iter()
        .map(|value| Record::try_from(value).unwrap())
        .collect()
    }

    fn names(records: &[Record]) -> Vec<String> {
        records
            .iter()
            .map(|record| record.get("name").and_then(Value::as_str).unwrap_or("").to_string())
            .collect()
    }

    #[tokio::test]
    async fn test_select_then_order() {
        let mut cursor = Cursor::from_records(people())
            .select(Query::new().with("born", "<1500"))
            .order(["born"]);
        let records = cursor.fetch().await.unwrap();
        assert_eq!(names(&records), ["Al-Khwarizmi", "Dante", "Leonardo"]);
    }

    #[tokio::test]
    async fn test_program_is_single_shot() {
        let mut cursor = Cursor::from_records(people()).limit(2);
        assert_eq!(cursor.program().len(), 1);
        assert_eq!(cursor.fetch().await.unwrap().len(), 2);
        assert!(cursor.program().is_empty());
        assert_eq!(cursor.fetch().await.unwrap().len(), 5);
    }

    #[tokio::test]
    async fn test_program_cleared_on_error() {
        let mut cursor = Cursor::postponed(|| {
            Box::pin(async { Err::<Vec<Record>, _>(ProviderError::BackendUnavailable("down".into())) })
        })
        .limit(1);
        assert!(matches!(
            cursor.fetch().await,
            Err(ProviderError::BackendUnavailable(_))
        ));
        assert!(cursor.program().is_empty());
    }

    #[tokio::test]
    async fn test_nothing_runs_before_fetch() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let cursor = Cursor::postponed(move || {
            counter.fetch_add(1, AtomicOrdering::SeqCst);
            Box::pin(async { Ok::<_, ProviderError>(people()) })
        });
        let mut cursor = cursor.order(["name"]).one();
        assert_eq!(calls.load(AtomicOrdering::SeqCst), 0);

        let records = cursor.fetch().await.unwrap();
        assert_eq!(calls.load(AtomicOrdering::SeqCst), 1);
        assert_eq!(names(&records), ["Al-Khwarizmi"]);
    }

    #[tokio::test]
    async fn test_memory_table_is_not_mutated() {
        let table = Arc::new(DashMap::new());
        for record in people() {
            table.insert(record.id().unwrap(), record);
        }
        let mut cursor = Cursor::new(Source::Memory(MemorySource::Table(Arc::clone(&table))))
            .map(|mut record| {
                record.insert("name", "changed");
                record
            });
        let records = cursor.fetch().await.unwrap();
        assert!(records.iter().all(|r| r.get("name") == Some(&json!("changed"))));
        assert_eq!(table.get(&1).unwrap().get("name"), Some(&json!("Leonardo")));
    }

    #[tokio::test]
    async fn test_invalid_condition_fails_fetch() {
        let mut cursor = Cursor::from_records(people()).select(Query::new().with("born", "<"));
        assert!(matches!(cursor.fetch().await, Err(ProviderError::Validation(_))));
    }

    #[tokio::test]
    async fn test_closures_and_projection() {
        let mut cursor = Cursor::from_records(people())
            .filter(|record| record.get("born").and_then(Value::as_i64).unwrap_or(0) > 1400)
            .sort(|a, b| b.id().cmp(&a.id()))
            .projection(["name"]);
        let records = cursor.fetch().await.unwrap();
        assert_eq!(names(&records), ["Curie", "Newton", "Leonardo"]);
        assert_eq!(records[0].len(), 1);
    }

    #[tokio::test]
    async fn test_set_operations_by_id() {
        let all = people();
        let first_two = all[..2].to_vec();
        let mut cursor = Cursor::from_records(first_two.clone()).complement(all.clone());
        let records = cursor.fetch().await.unwrap();
        assert_eq!(names(&records), ["Dante", "Al-Khwarizmi", "Curie"]);

        let mut cursor = Cursor::from_records(all).intersection(first_two);
        assert_eq!(cursor.fetch().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_memory_aggregates() {
        let mut cursor = Cursor::from_records(people()).select(Query::new().with("born", "<1500"));
        assert_eq!(cursor.count().await.unwrap(), 3);
        assert_eq!(Cursor::from_records(people()).sum("born").await.unwrap(), json!(7007));
        assert_eq!(Cursor::from_records(people()).min("born").await.unwrap(), json!(780));
        assert_eq!(Cursor::from_records(people()).max("born").await.unwrap(), json!(1867));
        assert_eq!(Cursor::from_records(people()).median("born").await.unwrap(), json!(1452.0));
    }

    #[tokio::test]
    async fn test_unsupported_aggregate() {
        let mut cursor = Cursor::postponed(|| Box::pin(async { Ok::<_, ProviderError>(people()) }));
        assert!(matches!(
            cursor.count().await,
            Err(ProviderError::NotImplemented(_))
        ));
        assert!(matches!(
            cursor.avg("born").await,
            Err(ProviderError::NotImplemented(_))
        ));
    }

    #[tokio::test]
    async fn test_next_streams_after_materializing() {
        let mut cursor = Cursor::from_records(people()).desc(["born"]).limit(2);
        let first = cursor.next().await.unwrap().unwrap();
        let second = cursor.next().await.unwrap().unwrap();
        assert_eq!(first.get("name"), Some(&json!("Curie")));
        assert_eq!(second.get("name"), Some(&json!("Newton")));
        assert!(cursor.next().await.unwrap().is_none());
    }

    #[test]
    fn test_debug_lists_program() {
        let cursor = Cursor::from_records(Vec::new()).order(["a"]).one();
        let rendered = format!("{:?}", cursor);
        assert!(rendered.contains("order"));
        assert!(rendered.contains("one"));
    }
}
