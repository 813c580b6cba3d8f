//! In-memory document engine
//!
//! Reference implementation of [`DocumentEngine`] for tests and ephemeral
//! configurations. It deliberately retains every written revision in an
//! append-only history, modelling a medium that never physically deletes:
//! a tombstoned document disappears from `find` but its payload stays in
//! history until [`DocumentEngine::destroy`] wipes the table. That retention
//! is what makes the store's true-purge sequence observable in tests.

use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use chrono::DateTime;
use parking_lot::RwLock;
use serde_json::Value;

use crate::engine::{
    is_tombstoned, DocumentEngine, EngineFactory, Query, ReplicationFilter, SortOrder,
    DOC_ID_FIELD,
};
use crate::error::{Error, Result};

#[derive(Default)]
struct TableRows {
    live: BTreeMap<String, Value>,
    history: Vec<Value>,
    indexes: HashMap<String, Vec<String>>,
    destroyed: bool,
}

#[derive(Default)]
struct TableData {
    rows: RwLock<TableRows>,
}

type TableRegistry = Arc<RwLock<HashMap<String, Arc<TableData>>>>;

/// Opens [`MemoryEngine`] handles; handles opened under the same table name
/// share state, so a factory stands in for one storage medium.
#[derive(Default, Clone)]
pub struct MemoryEngineFactory {
    tables: TableRegistry,
}

impl MemoryEngineFactory {
    /// Create an empty factory.
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a concrete handle, keeping access to the test-only inspection
    /// methods trait objects hide.
    pub fn open_memory(&self, table: &str) -> MemoryEngine {
        let data = {
            let mut tables = self.tables.write();
            Arc::clone(tables.entry(table.to_owned()).or_default())
        };
        MemoryEngine {
            table: table.to_owned(),
            data,
            registry: Arc::clone(&self.tables),
        }
    }
}

impl EngineFactory for MemoryEngineFactory {
    fn open(&self, table: &str) -> Result<Box<dyn DocumentEngine>> {
        Ok(Box::new(self.open_memory(table)))
    }
}

/// One table of JSON documents held in memory.
pub struct MemoryEngine {
    table: String,
    data: Arc<TableData>,
    registry: TableRegistry,
}

impl MemoryEngine {
    fn write_rows(&self) -> Result<parking_lot::RwLockWriteGuard<'_, TableRows>> {
        let rows = self.data.rows.write();
        if rows.destroyed {
            return Err(Error::StoreUnavailable(self.table.clone()));
        }
        Ok(rows)
    }

    fn read_rows(&self) -> Result<parking_lot::RwLockReadGuard<'_, TableRows>> {
        let rows = self.data.rows.read();
        if rows.destroyed {
            return Err(Error::StoreUnavailable(self.table.clone()));
        }
        Ok(rows)
    }

    /// Every revision ever written to this table, oldest first.
    pub fn history(&self) -> Vec<Value> {
        self.data.rows.read().history.clone()
    }

    /// Number of live (tombstones included) documents.
    pub fn live_len(&self) -> usize {
        self.data.rows.read().live.len()
    }
}

fn doc_id(doc: &Value) -> Result<String> {
    doc.get(DOC_ID_FIELD)
        .and_then(Value::as_str)
        .map(str::to_owned)
        .ok_or_else(|| Error::Storage("document missing id field".to_owned()))
}

fn compare_field(a: &Value, b: &Value, field: &str) -> Ordering {
    match (a.get(field), b.get(field)) {
        (Some(Value::Number(x)), Some(Value::Number(y))) => x
            .as_f64()
            .partial_cmp(&y.as_f64())
            .unwrap_or(Ordering::Equal),
        (Some(Value::String(x)), Some(Value::String(y))) => compare_strings(x, y),
        (Some(Value::Bool(x)), Some(Value::Bool(y))) => x.cmp(y),
        (Some(_), None) => Ordering::Greater,
        (None, Some(_)) => Ordering::Less,
        _ => Ordering::Equal,
    }
}

/// Timestamps serialize with variable subsecond precision, where the byte
/// order disagrees with the chronological order; compare them as instants.
fn compare_strings(x: &str, y: &str) -> Ordering {
    match (
        DateTime::parse_from_rfc3339(x),
        DateTime::parse_from_rfc3339(y),
    ) {
        (Ok(x), Ok(y)) => x.cmp(&y),
        _ => x.cmp(y),
    }
}

impl DocumentEngine for MemoryEngine {
    fn table(&self) -> &str {
        &self.table
    }

    fn put(&self, id: &str, doc: Value) -> Result<()> {
        let mut rows = self.write_rows()?;
        rows.history.push(doc.clone());
        rows.live.insert(id.to_owned(), doc);
        Ok(())
    }

    fn bulk_put(&self, docs: Vec<Value>) -> Result<()> {
        let mut rows = self.write_rows()?;
        for doc in docs {
            let id = doc_id(&doc)?;
            rows.history.push(doc.clone());
            rows.live.insert(id, doc);
        }
        Ok(())
    }

    fn find(&self, query: &Query) -> Result<Vec<Value>> {
        let rows = self.read_rows()?;

        if let Some(sorting) = &query.sorting {
            if let Some(index) = &sorting.use_index {
                if !rows.indexes.contains_key(index) {
                    return Err(Error::MissingIndex(index.clone()));
                }
            }
        }

        let mut docs: Vec<Value> = rows
            .live
            .values()
            .filter(|doc| !is_tombstoned(doc) && query.matches(doc))
            .cloned()
            .collect();

        if let Some(sorting) = &query.sorting {
            docs.sort_by(|a, b| {
                let ord = compare_field(a, b, &sorting.field);
                match sorting.order {
                    SortOrder::Asc => ord,
                    SortOrder::Desc => ord.reverse(),
                }
            });
            let docs_page: Vec<Value> = docs
                .into_iter()
                .skip(sorting.skip)
                .take(sorting.limit.unwrap_or(usize::MAX))
                .collect();
            return Ok(docs_page);
        }

        Ok(docs)
    }

    fn create_index(&self, name: &str, fields: &[String]) -> Result<()> {
        let mut rows = self.write_rows()?;
        rows.indexes.insert(name.to_owned(), fields.to_vec());
        Ok(())
    }

    fn replicate_all(
        &self,
        target: &dyn DocumentEngine,
        filter: Option<&ReplicationFilter<'_>>,
    ) -> Result<()> {
        let docs: Vec<(String, Value)> = {
            let rows = self.read_rows()?;
            rows.live
                .iter()
                .filter(|(_, doc)| filter.map_or(true, |f| f(doc)))
                .map(|(id, doc)| (id.clone(), doc.clone()))
                .collect()
        };
        for (id, doc) in docs {
            target.put(&id, doc)?;
        }
        Ok(())
    }

    fn destroy(&self) -> Result<()> {
        {
            let mut rows = self.data.rows.write();
            rows.live.clear();
            rows.history.clear();
            rows.indexes.clear();
            rows.destroyed = true;
        }
        self.registry.write().remove(&self.table);
        Ok(())
    }
}
