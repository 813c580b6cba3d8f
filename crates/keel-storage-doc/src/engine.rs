//! Document engine contract
//!
//! Minimal interface the persistence layer requires of its storage backend.
//! Any engine providing upsert, bulk write, indexed equality find, and full
//! replication is substitutable: a file-backed document store, an embedded
//! relational store behind a key/value shim, or the in-memory engine in
//! [`crate::memory`] used by tests.

use serde_json::Value;

use crate::error::Result;

/// Document field carrying the record id.
pub const DOC_ID_FIELD: &str = "id";

/// Document field carrying the tombstone flag.
pub const DOC_DELETED_FIELD: &str = "deleted";

/// Whether a document is tombstoned.
pub fn is_tombstoned(doc: &Value) -> bool {
    doc.get(DOC_DELETED_FIELD).and_then(Value::as_bool) == Some(true)
}

/// Sort direction for [`Sorting`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortOrder {
    /// Ascending
    Asc,
    /// Descending
    Desc,
}

/// Sorting and paging for a [`Query`].
#[derive(Debug, Clone)]
pub struct Sorting {
    /// Field to sort by. Must be covered by a declared index.
    pub field: String,
    /// Sort direction.
    pub order: SortOrder,
    /// Maximum number of documents to return.
    pub limit: Option<usize>,
    /// Number of matching documents to skip.
    pub skip: usize,
    /// Name of the index to serve the sort from.
    pub use_index: Option<String>,
}

impl Sorting {
    /// Sort by `field` in the given order, unpaged.
    pub fn by(field: impl Into<String>, order: SortOrder) -> Self {
        Self {
            field: field.into(),
            order,
            limit: None,
            skip: 0,
            use_index: None,
        }
    }
}

/// Equality-selector query over one table.
///
/// Every `selector` entry must match the document field of the same name
/// exactly. An empty selector matches all live documents.
#[derive(Debug, Clone, Default)]
pub struct Query {
    /// Field equality constraints.
    pub selector: serde_json::Map<String, Value>,
    /// Optional sorting and paging.
    pub sorting: Option<Sorting>,
}

impl Query {
    /// Match every live document.
    pub fn all() -> Self {
        Self::default()
    }

    /// Match documents whose fields equal the entries of `selector`.
    pub fn matching(selector: serde_json::Map<String, Value>) -> Self {
        Self {
            selector,
            sorting: None,
        }
    }

    /// Whether `doc` satisfies the selector.
    pub fn matches(&self, doc: &Value) -> bool {
        self.selector
            .iter()
            .all(|(field, expected)| doc.get(field) == Some(expected))
    }
}

/// Predicate applied to each document during replication.
pub type ReplicationFilter<'a> = dyn Fn(&Value) -> bool + 'a;

/// Storage backend for one table of JSON documents.
///
/// Documents are upserted by id; the engine retains whatever history its
/// medium imposes (replication logs, old revisions), which is why a true
/// purge must go through [`DocumentEngine::destroy`] rather than deletes.
pub trait DocumentEngine: Send + Sync {
    /// Name of the table this engine serves.
    fn table(&self) -> &str;

    /// Upsert one document under `id`.
    fn put(&self, id: &str, doc: Value) -> Result<()>;

    /// Upsert many documents; each carries its id in its `id` field.
    fn bulk_put(&self, docs: Vec<Value>) -> Result<()>;

    /// Find live, non-tombstoned documents matching `query`.
    fn find(&self, query: &Query) -> Result<Vec<Value>>;

    /// Declare a secondary index over `fields` under `name`. Idempotent.
    fn create_index(&self, name: &str, fields: &[String]) -> Result<()>;

    /// Copy the latest revision of every document (tombstones included) into
    /// `target`, subject to `filter`.
    fn replicate_all(
        &self,
        target: &dyn DocumentEngine,
        filter: Option<&ReplicationFilter<'_>>,
    ) -> Result<()>;

    /// Physically erase the table, its documents, and all retained history.
    ///
    /// Every handle to the table fails with
    /// [`crate::Error::StoreUnavailable`] afterwards.
    fn destroy(&self) -> Result<()>;
}

/// Opens engines by table name.
///
/// A store uses its factory twice: to recreate its own table after a purge
/// and to mint the disposable temporary table the rebuild drains into.
pub trait EngineFactory: Send + Sync {
    /// Open (or create) the engine for `table`.
    fn open(&self, table: &str) -> Result<Box<dyn DocumentEngine>>;
}
