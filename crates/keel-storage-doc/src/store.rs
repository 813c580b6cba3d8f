//! Generic versioned, optionally-encrypted document store
//!
//! [`EncryptedStore`] layers four concerns over an injected
//! [`DocumentEngine`]: transparent field encryption for a declared subset of
//! fields, schema-generation tagging of every record, upsert-by-derived-id
//! CRUD with declared secondary indexes, and a replicate/destroy/rebuild
//! sequence that physically purges records and rewrites key epochs.
//!
//! Callers always see plaintext on the read path while a key is active; the
//! on-disk copy is only rewritten on the next write. With no active key,
//! writes pass through plain and reads of already-ciphered records return
//! ciphertext verbatim, flagged as such (the locked, degraded mode).

use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use uuid::Uuid;

use crate::cipher::{PassphraseCipher, SharedCipher};
use crate::engine::{
    is_tombstoned, DocumentEngine, EngineFactory, Query, Sorting, DOC_DELETED_FIELD,
    DOC_ID_FIELD,
};
use crate::error::{Error, Result};

/// Document field carrying the schema generation tag.
pub const SCHEMA_GENERATION_FIELD: &str = "schema_generation";

/// Document field recording whether secret fields hold ciphertext.
pub const IS_ENCRYPTED_FIELD: &str = "is_encrypted";

/// Whether a record's declared secret fields currently hold ciphertext.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EncryptionState {
    /// Secret fields hold plaintext
    #[default]
    Plain,
    /// Secret fields hold ciphertext
    Ciphered,
}

/// Bookkeeping fields carried by every persisted record.
///
/// Flattened into each model so the store can stamp and inspect them at the
/// document level while entities round-trip through serde untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RecordMeta {
    /// Derived record id; stamped on insert.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// Schema generation that produced this record; stamped on insert.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema_generation: Option<String>,
    /// Encryption state of the declared secret fields.
    #[serde(default)]
    pub is_encrypted: EncryptionState,
    /// Tombstone flag; soft-deleted records stay in engine history.
    #[serde(default)]
    pub deleted: bool,
}

/// A persistable domain entity with a deterministic natural-key id.
pub trait Entity: Serialize + DeserializeOwned + Clone + Send {
    /// Derive the record id from the entity's natural-key fields.
    ///
    /// Re-inserting an entity with the same natural key overwrites rather
    /// than duplicates.
    fn record_id(&self) -> String;
}

/// Join natural-key parts into a stable record id.
pub fn derive_record_id(parts: &[&str]) -> String {
    parts.join("/")
}

/// Build an equality selector from field/value pairs.
pub fn selector<I>(pairs: I) -> Map<String, Value>
where
    I: IntoIterator<Item = (&'static str, Value)>,
{
    pairs
        .into_iter()
        .map(|(field, value)| (field.to_owned(), value))
        .collect()
}

/// Kind of mutation an observer is told about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    /// One or more records were inserted or upserted
    Inserted,
    /// One or more records were updated in place
    Updated,
    /// One or more records were tombstoned or purged
    Deleted,
}

/// Notification published after each mutating operation.
#[derive(Debug, Clone)]
pub struct StoreEvent {
    /// Table the mutation happened on.
    pub table: String,
    /// Kind of mutation.
    pub kind: EventKind,
}

/// Handle for cancelling a subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObserverId(u64);

type ObserverFn = Box<dyn Fn(&StoreEvent) + Send + Sync>;

/// Construction parameters for [`EncryptedStore`].
pub struct StoreOptions {
    /// Table name.
    pub table: String,
    /// Current schema generation; stamped on every insert.
    pub schema_generation: String,
    /// Fields ciphered at rest while a passphrase key is active.
    pub secret_fields: Vec<String>,
    /// Fields to declare secondary indexes for.
    pub indexed_fields: Vec<String>,
    /// Optional injected cipher context.
    pub cipher: Option<SharedCipher>,
}

/// Generic CRUD + indexing + transparent field encryption + schema tracking
/// + true-delete for one entity type over an external document engine.
pub struct EncryptedStore<T: Entity> {
    table: String,
    schema_generation: String,
    secret_fields: Vec<String>,
    field_index_map: HashMap<String, String>,
    cipher: Option<SharedCipher>,
    factory: Arc<dyn EngineFactory>,
    engine: RwLock<Option<Box<dyn DocumentEngine>>>,
    observers: Mutex<Vec<(u64, ObserverFn)>>,
    next_observer: Mutex<u64>,
    _marker: PhantomData<fn() -> T>,
}

impl<T: Entity> EncryptedStore<T> {
    /// Open the store's table through `factory` and declare its indexes.
    pub fn open(options: StoreOptions, factory: Arc<dyn EngineFactory>) -> Result<Self> {
        let StoreOptions {
            table,
            schema_generation,
            secret_fields,
            indexed_fields,
            cipher,
        } = options;

        let engine = factory.open(&table)?;
        let mut field_index_map = HashMap::new();
        for field in &indexed_fields {
            let index = format!("idx-{field}");
            engine.create_index(&index, std::slice::from_ref(field))?;
            field_index_map.insert(field.clone(), index);
        }
        tracing::debug!(table = %table, indexes = indexed_fields.len(), "opened document store");

        Ok(Self {
            table,
            schema_generation,
            secret_fields,
            field_index_map,
            cipher,
            factory,
            engine: RwLock::new(Some(engine)),
            observers: Mutex::new(Vec::new()),
            next_observer: Mutex::new(0),
            _marker: PhantomData,
        })
    }

    /// Table name.
    pub fn table(&self) -> &str {
        &self.table
    }

    /// Schema generation stamped on new records.
    pub fn schema_generation(&self) -> &str {
        &self.schema_generation
    }

    // ------------------------------------------------------------------
    // Write path
    // ------------------------------------------------------------------

    /// Upsert one entity by its derived id and stamp the current schema
    /// generation. Declared secret fields are ciphered when a key is active.
    pub fn insert(&self, entity: &T) -> Result<()> {
        let (id, doc) = self.prepare_doc(entity)?;
        self.with_engine(|engine| engine.put(&id, doc))?;
        self.notify(EventKind::Inserted);
        Ok(())
    }

    /// Upsert many entities in one engine round trip.
    pub fn insert_many(&self, entities: &[T]) -> Result<()> {
        if entities.is_empty() {
            return Ok(());
        }
        let docs = entities
            .iter()
            .map(|entity| self.prepare_doc(entity).map(|(_, doc)| doc))
            .collect::<Result<Vec<_>>>()?;
        self.with_engine(move |engine| engine.bulk_put(docs))?;
        self.notify(EventKind::Inserted);
        Ok(())
    }

    /// Read all matches, shallow-merge `patch` onto each, and bulk-write the
    /// result back. Returns the match count.
    ///
    /// Not atomic across the read/write pair: a concurrent writer touching
    /// the same records can be lost. Callers mutating related records must
    /// self-serialize.
    pub fn find_and_update(&self, sel: Map<String, Value>, patch: &Map<String, Value>) -> Result<usize> {
        if self.store_locked() {
            for field in &self.secret_fields {
                if patch.contains_key(field) {
                    return Err(Error::Storage(format!(
                        "cannot patch secret field {field} while the store is locked"
                    )));
                }
            }
        }

        let mut docs = self.raw_find(&Query::matching(sel))?;
        for doc in &mut docs {
            self.outgoing(doc)?;
            for (field, value) in patch {
                doc[field.as_str()] = value.clone();
            }
            self.incoming(doc)?;
        }
        let count = docs.len();
        if count > 0 {
            self.with_engine(move |engine| engine.bulk_put(docs))?;
            self.notify(EventKind::Updated);
        }
        Ok(count)
    }

    // ------------------------------------------------------------------
    // Read path
    // ------------------------------------------------------------------

    /// Fetch one record by id, deciphered when a key is active.
    pub fn get_by_id(&self, id: &str) -> Result<Option<T>> {
        let sel = selector([(DOC_ID_FIELD, json!(id))]);
        self.get_one(sel)
    }

    /// Fetch the first record matching `sel`.
    pub fn get_one(&self, sel: Map<String, Value>) -> Result<Option<T>> {
        let docs = self.raw_find(&Query::matching(sel))?;
        docs.into_iter().next().map(|doc| self.read_doc(doc)).transpose()
    }

    /// Fetch every record matching `sel`, or the whole table when `None`.
    pub fn get_all(&self, sel: Option<Map<String, Value>>) -> Result<Vec<T>> {
        let query = match sel {
            Some(sel) => Query::matching(sel),
            None => Query::all(),
        };
        self.raw_find(&query)?
            .into_iter()
            .map(|doc| self.read_doc(doc))
            .collect()
    }

    /// Fetch records matching `sel` with sorting and paging.
    ///
    /// Sorting by a field with no declared index fails fast with
    /// [`Error::MissingIndex`] instead of falling back to an unordered scan.
    pub fn execute_query(
        &self,
        sel: Map<String, Value>,
        sorting: Option<Sorting>,
    ) -> Result<Vec<T>> {
        let sorting = match sorting {
            Some(mut sorting) => {
                let index = self
                    .field_index_map
                    .get(&sorting.field)
                    .ok_or_else(|| Error::MissingIndex(sorting.field.clone()))?;
                sorting.use_index = Some(index.clone());
                Some(sorting)
            }
            None => None,
        };
        let query = Query {
            selector: sel,
            sorting,
        };
        self.raw_find(&query)?
            .into_iter()
            .map(|doc| self.read_doc(doc))
            .collect()
    }

    /// Fetch the raw persisted document for `id`, bypassing the deciphering
    /// read path. For migration and diagnostic tooling.
    pub fn raw_by_id(&self, id: &str) -> Result<Option<Value>> {
        let sel = selector([(DOC_ID_FIELD, json!(id))]);
        Ok(self.raw_find(&Query::matching(sel))?.into_iter().next())
    }

    // ------------------------------------------------------------------
    // Delete path
    // ------------------------------------------------------------------

    /// Tombstone every record matching `sel`. History may remain in the
    /// engine; use [`EncryptedStore::delete_truly`] to purge. Returns the
    /// match count.
    pub fn delete(&self, sel: Map<String, Value>) -> Result<usize> {
        let count = self.tombstone(sel)?;
        if count > 0 {
            self.notify(EventKind::Deleted);
        }
        Ok(count)
    }

    /// Tombstone one record by id; fails with [`Error::NotFound`] when the
    /// id matches nothing.
    pub fn delete_by_id(&self, id: &str) -> Result<()> {
        let sel = selector([(DOC_ID_FIELD, json!(id))]);
        if self.tombstone(sel)? == 0 {
            return Err(Error::NotFound(format!("{}/{id}", self.table)));
        }
        self.notify(EventKind::Deleted);
        Ok(())
    }

    /// Physically purge every record matching `sel`.
    ///
    /// Tombstones the matches, then replicates the table into a disposable
    /// temporary store through a filter excluding tombstones, destroys the
    /// original, and rebuilds it from the temporary. This is the only way to
    /// guarantee a purged record cannot be recovered from retained history.
    pub fn delete_truly(&self, sel: Map<String, Value>) -> Result<usize> {
        let count = self.tombstone(sel)?;
        if count > 0 {
            self.rebuild(None)?;
            self.notify(EventKind::Deleted);
        }
        Ok(count)
    }

    fn tombstone(&self, sel: Map<String, Value>) -> Result<usize> {
        let mut docs = self.raw_find(&Query::matching(sel))?;
        for doc in &mut docs {
            doc[DOC_DELETED_FIELD] = json!(true);
        }
        let count = docs.len();
        if count > 0 {
            self.with_engine(move |engine| engine.bulk_put(docs))?;
        }
        Ok(count)
    }

    // ------------------------------------------------------------------
    // Key rotation
    // ------------------------------------------------------------------

    /// Rewrite every record under a new key epoch.
    ///
    /// Records ciphered under `old_material` (pass `None` when the table is
    /// plain) stream through the rebuild and land ciphered under
    /// `new_material`; the shared cipher commits to the new material only
    /// after the rebuild lands. No disk state ever mixes two key epochs
    /// within the table.
    pub fn encrypt_secrets(&self, new_material: &str, old_material: Option<&str>) -> Result<()> {
        let cipher = self.require_cipher()?;
        let (old_fork, new_fork) = {
            let guard = cipher.read();
            (guard.fork(old_material)?, guard.fork(Some(new_material))?)
        };

        let secret_fields = self.secret_fields.clone();
        self.rebuild(Some(&move |doc: &mut Value| {
            apply_outgoing(&old_fork, &secret_fields, doc)?;
            apply_incoming(&new_fork, &secret_fields, doc)
        }))?;

        cipher.write().set_key_material(Some(new_material))?;
        tracing::info!(table = %self.table, "secret fields re-ciphered under new key");
        Ok(())
    }

    /// Rewrite every record back to plaintext and destroy the active key.
    pub fn decrypt_secrets(&self, old_material: &str) -> Result<()> {
        let cipher = self.require_cipher()?;
        let old_fork = cipher.read().fork(Some(old_material))?;

        let secret_fields = self.secret_fields.clone();
        self.rebuild(Some(&move |doc: &mut Value| {
            apply_outgoing(&old_fork, &secret_fields, doc)
        }))?;

        cipher.write().destroy();
        tracing::info!(table = %self.table, "secret fields deciphered, key destroyed");
        Ok(())
    }

    // ------------------------------------------------------------------
    // Schema generation
    // ------------------------------------------------------------------

    /// Whether any live record was written under a different schema
    /// generation than the store's current one. Records with no generation
    /// tag count as incompatible.
    pub fn has_incompatible_data(&self) -> Result<bool> {
        let docs = self.raw_find(&Query::all())?;
        Ok(docs.iter().any(|doc| {
            doc.get(SCHEMA_GENERATION_FIELD).and_then(Value::as_str)
                != Some(self.schema_generation.as_str())
        }))
    }

    /// Run an entity-level rewrite pass over the whole table, restamping the
    /// current schema generation on every record. Returns the record count.
    pub fn rewrite_all<F>(&self, rewrite: F) -> Result<usize>
    where
        F: Fn(T) -> Result<T>,
    {
        let entities = self.get_all(None)?;
        let count = entities.len();
        if count == 0 {
            return Ok(0);
        }
        let docs = entities
            .into_iter()
            .map(|entity| {
                let rewritten = rewrite(entity)?;
                self.prepare_doc(&rewritten).map(|(_, doc)| doc)
            })
            .collect::<Result<Vec<_>>>()?;
        self.with_engine(move |engine| engine.bulk_put(docs))?;
        self.notify(EventKind::Updated);
        tracing::debug!(table = %self.table, count, "rewrote records under current schema generation");
        Ok(count)
    }

    // ------------------------------------------------------------------
    // Observers
    // ------------------------------------------------------------------

    /// Register an observer called after each mutating operation.
    pub fn subscribe<F>(&self, observer: F) -> ObserverId
    where
        F: Fn(&StoreEvent) + Send + Sync + 'static,
    {
        let mut next = self.next_observer.lock();
        let id = *next;
        *next += 1;
        self.observers.lock().push((id, Box::new(observer)));
        ObserverId(id)
    }

    /// Remove a previously registered observer.
    pub fn unsubscribe(&self, id: ObserverId) {
        self.observers.lock().retain(|(existing, _)| *existing != id.0);
    }

    fn notify(&self, kind: EventKind) {
        let event = StoreEvent {
            table: self.table.clone(),
            kind,
        };
        for (_, observer) in self.observers.lock().iter() {
            observer(&event);
        }
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    fn with_engine<R>(&self, f: impl FnOnce(&dyn DocumentEngine) -> Result<R>) -> Result<R> {
        let guard = self.engine.read();
        match guard.as_deref() {
            Some(engine) => f(engine),
            None => Err(Error::StoreUnavailable(self.table.clone())),
        }
    }

    fn raw_find(&self, query: &Query) -> Result<Vec<Value>> {
        self.with_engine(|engine| engine.find(query))
    }

    fn require_cipher(&self) -> Result<&SharedCipher> {
        self.cipher
            .as_ref()
            .ok_or_else(|| Error::Storage(format!("no cipher attached to table {}", self.table)))
    }

    /// Cipher attached but no key set: ciphered records cannot be read back.
    fn store_locked(&self) -> bool {
        match &self.cipher {
            Some(cipher) => !cipher.read().is_active(),
            None => false,
        }
    }

    fn prepare_doc(&self, entity: &T) -> Result<(String, Value)> {
        let mut doc = serde_json::to_value(entity)?;
        if !doc.is_object() {
            return Err(Error::Storage(format!(
                "entity for table {} did not serialize to an object",
                self.table
            )));
        }
        let id = entity.record_id();
        doc[DOC_ID_FIELD] = json!(id);
        doc[SCHEMA_GENERATION_FIELD] = json!(self.schema_generation);
        self.incoming(&mut doc)?;
        Ok((id, doc))
    }

    fn read_doc(&self, mut doc: Value) -> Result<T> {
        self.outgoing(&mut doc)?;
        Ok(serde_json::from_value(doc)?)
    }

    /// Write transform: cipher declared secret fields when a key is active
    /// and the record is plain.
    fn incoming(&self, doc: &mut Value) -> Result<()> {
        if let Some(cipher) = &self.cipher {
            apply_incoming(&cipher.read(), &self.secret_fields, doc)?;
        }
        Ok(())
    }

    /// Read transform: decipher declared secret fields when a key is active
    /// and the record is ciphered. A failed decrypt propagates; ciphertext is
    /// never silently returned while a key is active.
    fn outgoing(&self, doc: &mut Value) -> Result<()> {
        if let Some(cipher) = &self.cipher {
            apply_outgoing(&cipher.read(), &self.secret_fields, doc)?;
        }
        Ok(())
    }

    /// Replicate live records into a disposable temporary store, apply the
    /// optional per-document rewrite to the drained copy, destroy the table,
    /// recreate it with identical index configuration, and load the rewritten
    /// records back.
    ///
    /// The temporary is fully materialized and the rewrite has succeeded on
    /// every document before the original is destroyed, so a bad rotation key
    /// fails with the table intact. A failure after the destroy leaves the
    /// store unavailable (every operation fails loudly) and keeps the
    /// temporary intact for operator recovery; it is never silently resolved.
    fn rebuild(&self, rewrite: Option<&RewriteFn>) -> Result<()> {
        let temp_table = format!("temp-{}-{}", self.table, Uuid::new_v4().simple());
        let temp = self.factory.open(&temp_table)?;

        self.with_engine(|engine| {
            engine.replicate_all(temp.as_ref(), Some(&|doc: &Value| !is_tombstoned(doc)))
        })?;

        let docs = match self.rewrite_drained(temp.as_ref(), rewrite) {
            Ok(docs) => docs,
            Err(err) => {
                let _ = temp.destroy();
                return Err(err);
            }
        };

        {
            let mut slot = self.engine.write();
            let engine = match slot.take() {
                Some(engine) => engine,
                None => {
                    let _ = temp.destroy();
                    return Err(Error::StoreUnavailable(self.table.clone()));
                }
            };
            if let Err(err) = engine.destroy() {
                *slot = Some(engine);
                let _ = temp.destroy();
                return Err(err);
            }
        }

        match self.reload_with(docs) {
            Ok(engine) => {
                *self.engine.write() = Some(engine);
                temp.destroy()?;
                tracing::debug!(table = %self.table, "table rebuilt");
                Ok(())
            }
            Err(err) => {
                tracing::error!(
                    table = %self.table,
                    temp = %temp_table,
                    error = %err,
                    "table rebuild failed after destroy; temporary store retained for recovery"
                );
                Err(err)
            }
        }
    }

    /// The rewritten records are held in memory only: the temporary keeps the
    /// pre-rewrite (still-ciphered) copy for recovery.
    fn rewrite_drained(
        &self,
        temp: &dyn DocumentEngine,
        rewrite: Option<&RewriteFn>,
    ) -> Result<Vec<Value>> {
        let mut docs = temp.find(&Query::all())?;
        if let Some(rewrite) = rewrite {
            for doc in &mut docs {
                rewrite(doc)?;
            }
        }
        Ok(docs)
    }

    fn reload_with(&self, docs: Vec<Value>) -> Result<Box<dyn DocumentEngine>> {
        let engine = self.factory.open(&self.table)?;
        for (field, index) in &self.field_index_map {
            engine.create_index(index, std::slice::from_ref(field))?;
        }
        if !docs.is_empty() {
            engine.bulk_put(docs)?;
        }
        Ok(engine)
    }
}

type RewriteFn = dyn Fn(&mut Value) -> Result<()>;

fn doc_state(doc: &Value) -> EncryptionState {
    match doc.get(IS_ENCRYPTED_FIELD).and_then(Value::as_str) {
        Some("ciphered") => EncryptionState::Ciphered,
        _ => EncryptionState::Plain,
    }
}

fn apply_incoming(cipher: &PassphraseCipher, secret_fields: &[String], doc: &mut Value) -> Result<()> {
    if !cipher.is_active() || secret_fields.is_empty() {
        return Ok(());
    }
    if doc_state(doc) == EncryptionState::Ciphered {
        return Ok(());
    }
    for field in secret_fields {
        if let Some(Value::String(plaintext)) = doc.get(field) {
            let ciphertext = cipher.encrypt(plaintext)?;
            doc[field.as_str()] = Value::String(ciphertext);
        }
    }
    doc[IS_ENCRYPTED_FIELD] = json!(EncryptionState::Ciphered);
    Ok(())
}

fn apply_outgoing(cipher: &PassphraseCipher, secret_fields: &[String], doc: &mut Value) -> Result<()> {
    if !cipher.is_active() || secret_fields.is_empty() {
        return Ok(());
    }
    if doc_state(doc) != EncryptionState::Ciphered {
        return Ok(());
    }
    for field in secret_fields {
        if let Some(Value::String(ciphertext)) = doc.get(field) {
            let plaintext = cipher.decrypt(ciphertext)?;
            doc[field.as_str()] = Value::String(plaintext);
        }
    }
    doc[IS_ENCRYPTED_FIELD] = json!(EncryptionState::Plain);
    Ok(())
}
