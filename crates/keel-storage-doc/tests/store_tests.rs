//! Generic document store behavior
//!
//! Covers upsert-by-derived-id, selector updates, soft delete versus true
//! purge against the engine's retained history, schema generation tracking,
//! index enforcement, observers, and the unavailable state after a failed or
//! foreign destroy.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::json;

use keel_storage_doc::accounts::AccountStore;
use keel_storage_doc::memory::MemoryEngineFactory;
use keel_storage_doc::models::{Account, Token};
use keel_storage_doc::store::RecordMeta;
use keel_storage_doc::{
    selector, DocumentEngine, EncryptedStore, EngineFactory, Error, EventKind, SortOrder, Sorting,
    StoreOptions,
};

fn token_store(factory: Arc<MemoryEngineFactory>, generation: &str) -> EncryptedStore<Token> {
    EncryptedStore::open(
        StoreOptions {
            table: "tokens".to_owned(),
            schema_generation: generation.to_owned(),
            secret_fields: Vec::new(),
            indexed_fields: vec!["wallet_id".to_owned()],
            cipher: None,
        },
        factory,
    )
    .unwrap()
}

fn sample_token(wallet_id: &str, token_id: &str, balance: &str) -> Token {
    Token {
        meta: RecordMeta::default(),
        wallet_id: wallet_id.to_owned(),
        parent_coin_id: "eth".to_owned(),
        token_id: token_id.to_owned(),
        balance: balance.to_owned(),
    }
}

fn sample_account(wallet_id: &str, xpub: &str) -> Account {
    Account {
        meta: RecordMeta::default(),
        account_id: None,
        wallet_id: wallet_id.to_owned(),
        coin_id: "btc".to_owned(),
        xpub: xpub.to_owned(),
        account_type: None,
        account_index: 0,
        total_balance: "0".to_owned(),
        total_unconfirmed_balance: "0".to_owned(),
    }
}

// =============================================================================
// Upsert and update semantics
// =============================================================================

#[test]
fn test_reinsert_same_natural_key_overwrites() {
    let factory = Arc::new(MemoryEngineFactory::new());
    let store = token_store(factory, "v1");

    store.insert(&sample_token("w1", "usdc", "10")).unwrap();
    store.insert(&sample_token("w1", "usdc", "25")).unwrap();

    let all = store.get_all(None).unwrap();
    assert_eq!(all.len(), 1);
    assert_eq!(all[0].balance, "25");
    assert_eq!(all[0].meta.id.as_deref(), Some("w1/eth/usdc"));
}

#[test]
fn test_insert_stamps_schema_generation() {
    let factory = Arc::new(MemoryEngineFactory::new());
    let store = token_store(factory, "v1");

    store.insert(&sample_token("w1", "usdc", "10")).unwrap();
    let token = store.get_by_id("w1/eth/usdc").unwrap().unwrap();
    assert_eq!(token.meta.schema_generation.as_deref(), Some("v1"));
}

#[test]
fn test_find_and_update_merges_patch() {
    let factory = Arc::new(MemoryEngineFactory::new());
    let store = token_store(factory, "v1");
    store.insert(&sample_token("w1", "usdc", "10")).unwrap();
    store.insert(&sample_token("w1", "dai", "5")).unwrap();
    store.insert(&sample_token("w2", "usdc", "7")).unwrap();

    let count = store
        .find_and_update(
            selector([("wallet_id", json!("w1"))]),
            &selector([("balance", json!("0"))]),
        )
        .unwrap();
    assert_eq!(count, 2);

    // Patched fields change, everything else survives the merge.
    let token = store.get_by_id("w1/eth/usdc").unwrap().unwrap();
    assert_eq!(token.balance, "0");
    assert_eq!(token.token_id, "usdc");
    assert_eq!(store.get_by_id("w2/eth/usdc").unwrap().unwrap().balance, "7");
}

#[test]
fn test_find_and_update_without_match_is_zero() {
    let factory = Arc::new(MemoryEngineFactory::new());
    let store = token_store(factory, "v1");
    let count = store
        .find_and_update(
            selector([("wallet_id", json!("nope"))]),
            &selector([("balance", json!("0"))]),
        )
        .unwrap();
    assert_eq!(count, 0);
}

// =============================================================================
// Soft delete versus true purge
// =============================================================================

#[test]
fn test_soft_delete_hides_but_retains_history() {
    let factory = Arc::new(MemoryEngineFactory::new());
    let store = token_store(Arc::clone(&factory), "v1");
    store.insert(&sample_token("w1", "usdc", "10")).unwrap();

    let count = store.delete(selector([("wallet_id", json!("w1"))])).unwrap();
    assert_eq!(count, 1);
    assert!(store.get_all(None).unwrap().is_empty());

    // The payload is still recoverable from the engine's history.
    let engine = factory.open_memory("tokens");
    assert!(engine
        .history()
        .iter()
        .any(|doc| doc["token_id"] == "usdc" && doc["balance"] == "10"));
}

#[test]
fn test_delete_by_id_unknown_is_not_found() {
    let factory = Arc::new(MemoryEngineFactory::new());
    let store = token_store(factory, "v1");
    assert!(matches!(
        store.delete_by_id("w1/eth/usdc"),
        Err(Error::NotFound(_))
    ));
}

#[test]
fn test_true_purge_erases_record_from_history() {
    let factory = Arc::new(MemoryEngineFactory::new());
    let accounts = AccountStore::new(Arc::clone(&factory) as Arc<dyn EngineFactory>, None).unwrap();
    accounts.insert(sample_account("w1", "xpub-secret-one")).unwrap();
    accounts.insert(sample_account("w2", "xpub-other")).unwrap();

    let purged = accounts.remove_wallet("w1").unwrap();
    assert_eq!(purged, 1);

    // The rebuilt table carries the survivor and no trace of the purged
    // wallet, not even in retained history.
    let engine = factory.open_memory("accounts");
    assert!(!engine.history().is_empty());
    for doc in engine.history() {
        assert_ne!(doc["wallet_id"], "w1");
        assert_ne!(doc["xpub"], "xpub-secret-one");
    }

    let survivors = accounts.store().get_all(None).unwrap();
    assert_eq!(survivors.len(), 1);
    assert_eq!(survivors[0].wallet_id, "w2");
}

#[test]
fn test_store_usable_across_rebuild() {
    let factory = Arc::new(MemoryEngineFactory::new());
    let accounts = AccountStore::new(factory, None).unwrap();
    accounts.insert(sample_account("w1", "xpub-one")).unwrap();
    accounts.remove_wallet("w1").unwrap();

    // Writes after a rebuild land in the recreated table with its indexes.
    accounts.insert(sample_account("w3", "xpub-three")).unwrap();
    assert_eq!(accounts.by_wallet("w3").unwrap().len(), 1);
}

// =============================================================================
// Schema generations
// =============================================================================

#[test]
fn test_schema_generation_mismatch_detected_and_rewritten() {
    let factory = Arc::new(MemoryEngineFactory::new());

    let v1 = token_store(Arc::clone(&factory), "v1");
    v1.insert(&sample_token("w1", "usdc", "10")).unwrap();
    assert!(!v1.has_incompatible_data().unwrap());

    let v2 = token_store(Arc::clone(&factory), "v2");
    assert!(v2.has_incompatible_data().unwrap());

    let count = v2.rewrite_all(Ok).unwrap();
    assert_eq!(count, 1);
    assert!(!v2.has_incompatible_data().unwrap());

    let token = v2.get_by_id("w1/eth/usdc").unwrap().unwrap();
    assert_eq!(token.meta.schema_generation.as_deref(), Some("v2"));
    assert_eq!(token.balance, "10");
}

// =============================================================================
// Index enforcement
// =============================================================================

#[test]
fn test_sorting_by_undeclared_field_fails_fast() {
    let factory = Arc::new(MemoryEngineFactory::new());
    let store = token_store(factory, "v1");
    store.insert(&sample_token("w1", "usdc", "10")).unwrap();

    let result = store.execute_query(
        selector([("wallet_id", json!("w1"))]),
        Some(Sorting::by("balance", SortOrder::Asc)),
    );
    assert!(matches!(result, Err(Error::MissingIndex(field)) if field == "balance"));
}

#[test]
fn test_sorting_by_indexed_field_works() {
    let factory = Arc::new(MemoryEngineFactory::new());
    let store = token_store(factory, "v1");
    store.insert(&sample_token("w1", "usdc", "10")).unwrap();
    store.insert(&sample_token("w2", "usdc", "5")).unwrap();
    store.insert(&sample_token("w3", "usdc", "7")).unwrap();

    let mut sorting = Sorting::by("wallet_id", SortOrder::Desc);
    sorting.limit = Some(2);
    let page = store
        .execute_query(selector([("token_id", json!("usdc"))]), Some(sorting))
        .unwrap();
    assert_eq!(page.len(), 2);
    assert_eq!(page[0].wallet_id, "w3");
    assert_eq!(page[1].wallet_id, "w2");
}

// =============================================================================
// Observers
// =============================================================================

#[test]
fn test_observers_see_mutations_until_unsubscribed() {
    let factory = Arc::new(MemoryEngineFactory::new());
    let store = token_store(factory, "v1");

    let events: Arc<Mutex<Vec<EventKind>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&events);
    let id = store.subscribe(move |event| {
        assert_eq!(event.table, "tokens");
        sink.lock().push(event.kind);
    });

    store.insert(&sample_token("w1", "usdc", "10")).unwrap();
    store
        .find_and_update(
            selector([("wallet_id", json!("w1"))]),
            &selector([("balance", json!("1"))]),
        )
        .unwrap();
    store.delete(selector([("wallet_id", json!("w1"))])).unwrap();

    assert_eq!(
        events.lock().as_slice(),
        &[EventKind::Inserted, EventKind::Updated, EventKind::Deleted]
    );

    store.unsubscribe(id);
    store.insert(&sample_token("w2", "usdc", "3")).unwrap();
    assert_eq!(events.lock().len(), 3);
}

#[test]
fn test_multiple_observers_each_notified() {
    let factory = Arc::new(MemoryEngineFactory::new());
    let store = token_store(factory, "v1");

    let calls = Arc::new(AtomicUsize::new(0));
    for _ in 0..2 {
        let counter = Arc::clone(&calls);
        store.subscribe(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
    }

    store.insert(&sample_token("w1", "usdc", "10")).unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

// =============================================================================
// Unavailable state
// =============================================================================

#[test]
fn test_operations_fail_loudly_after_foreign_destroy() {
    let factory = Arc::new(MemoryEngineFactory::new());
    let store = token_store(Arc::clone(&factory), "v1");
    store.insert(&sample_token("w1", "usdc", "10")).unwrap();

    // Another handle destroys the table out from under the store.
    factory.open_memory("tokens").destroy().unwrap();

    assert!(matches!(
        store.get_all(None),
        Err(Error::StoreUnavailable(_))
    ));
    assert!(matches!(
        store.insert(&sample_token("w1", "dai", "1")),
        Err(Error::StoreUnavailable(_))
    ));
}
