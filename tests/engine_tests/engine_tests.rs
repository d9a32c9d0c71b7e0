//! Tests for Engine
//!
//! These tests verify:
//! - Post, query, update and delete in the open and closed chapters
//! - Chapter rotation and expiry of old chapters
//! - Requests parked on page reads come back and complete
//! - Sparse chapters keep only sampled names in the volume index
//! - A hook hit lets the other names of its sparse chapter be found
//! - Save and load, including with another zone count
//! - Synchronous searches when no reader threads run
//! - Contract errors: wrong zone, use after shutdown

use std::sync::Arc;
use std::thread;

use dedupe_index::storage::{BlockStorage, MemoryStorage};
use dedupe_index::{
    Config, Engine, IndexError, Outcome, RecordData, RecordName, Request, RequestKind, Response,
};

// =============================================================================
// Helper Functions
// =============================================================================

/// 128 records per chapter, 8 chapters
fn config(zones: u32, read_threads: usize) -> Config {
    Config::builder()
        .record_pages_per_chapter(1)
        .chapters_per_volume(8)
        .zone_count(zones)
        .min_delta_lists(16)
        .cache_chapters(2)
        .read_queue_capacity(16)
        .read_threads(read_threads)
        .nonce(42)
        .build()
}

fn sparse_config() -> Config {
    Config::builder()
        .record_pages_per_chapter(1)
        .chapters_per_volume(16)
        .sparse_chapters_per_volume(8)
        .sparse_sample_rate(4)
        .zone_count(2)
        .min_delta_lists(16)
        .cache_chapters(2)
        .read_threads(2)
        .nonce(42)
        .build()
}

fn memory_storage(config: &Config) -> Arc<dyn BlockStorage> {
    Arc::new(MemoryStorage::new(Engine::required_blocks(config).unwrap()))
}

fn setup(config: Config) -> Engine {
    let storage = memory_storage(&config);
    Engine::create_with_storage(config, storage).unwrap()
}

fn name(i: u64) -> RecordName {
    RecordName::from_data(&i.to_le_bytes())
}

fn run(engine: &Engine, i: u64, kind: RequestKind, metadata: u64) -> Response {
    let request = engine
        .request(i, name(i), kind)
        .with_metadata(RecordData::from_u64(metadata));
    engine.execute_sync(&request).unwrap()
}

fn post(engine: &Engine, i: u64) -> Response {
    run(engine, i, RequestKind::Post, i)
}

fn query(engine: &Engine, i: u64) -> Response {
    run(engine, i, RequestKind::Query, 0)
}

/// Names posted to chapter 0 of a sparse index
const SPARSE_NAMES: u64 = 60;

/// Post names to chapter 0, then close chapters until it leaves the dense window
fn fill_sparse_chapter(engine: &Engine) {
    for i in 0..SPARSE_NAMES {
        post(engine, i);
    }
    for _ in 0..9 {
        engine.flush_open_chapter().unwrap();
    }
    assert_eq!(engine.stats().open_chapter, 9);
}

/// The posted names split into hooks and the rest, at the sparse sample rate
fn split_hooks() -> (Vec<u64>, Vec<u64>) {
    (0..SPARSE_NAMES).partition(|&i| name(i).sampling_bytes() % 4 == 0)
}

// =============================================================================
// Basic Operations Tests
// =============================================================================

#[test]
fn test_post_then_query_in_open_chapter() {
    let engine = setup(config(1, 2));

    let first = post(&engine, 1);
    assert!(!first.found);
    assert_eq!(first.old_metadata, None);

    let duplicate = run(&engine, 1, RequestKind::Post, 99);
    assert!(duplicate.found);
    assert_eq!(duplicate.virtual_chapter, Some(0));
    assert_eq!(duplicate.old_metadata, Some(RecordData::from_u64(1)));

    // A duplicate post keeps the original metadata
    assert_eq!(query(&engine, 1).old_metadata, Some(RecordData::from_u64(1)));
    assert!(!query(&engine, 2).found);

    let stats = engine.stats();
    assert_eq!(stats.posts, 2);
    assert_eq!(stats.queries, 2);
    assert_eq!(stats.found_in_open_chapter, 2);
    assert_eq!(stats.open_chapter_records, 1);
}

#[test]
fn test_duplicate_found_in_closed_chapter() {
    let engine = setup(config(1, 2));
    for i in 0..50 {
        post(&engine, i);
    }
    engine.flush_open_chapter().unwrap();
    assert_eq!(engine.stats().open_chapter, 1);

    for i in 0..50 {
        let response = query(&engine, i);
        assert!(response.found, "name {}", i);
        assert_eq!(response.virtual_chapter, Some(0));
        assert_eq!(response.old_metadata, Some(RecordData::from_u64(i)));
    }

    // Posting again moves the name into the open chapter
    let response = run(&engine, 7, RequestKind::Post, 1234);
    assert!(response.found);
    assert_eq!(response.virtual_chapter, Some(0));
    let moved = query(&engine, 7);
    assert_eq!(moved.virtual_chapter, Some(1));
    assert_eq!(moved.old_metadata, Some(RecordData::from_u64(7)));
}

#[test]
fn test_update_replaces_metadata() {
    let engine = setup(config(1, 2));
    post(&engine, 1);
    post(&engine, 2);

    let response = run(&engine, 1, RequestKind::Update, 100);
    assert!(response.found);
    assert_eq!(response.old_metadata, Some(RecordData::from_u64(1)));
    assert_eq!(query(&engine, 1).old_metadata, Some(RecordData::from_u64(100)));

    engine.flush_open_chapter().unwrap();
    let response = run(&engine, 2, RequestKind::Update, 200);
    assert_eq!(response.virtual_chapter, Some(0));
    let updated = query(&engine, 2);
    assert_eq!(updated.virtual_chapter, Some(1));
    assert_eq!(updated.old_metadata, Some(RecordData::from_u64(200)));

    // Updating an unknown name stores it
    let response = run(&engine, 3, RequestKind::Update, 300);
    assert!(!response.found);
    assert_eq!(query(&engine, 3).old_metadata, Some(RecordData::from_u64(300)));
}

#[test]
fn test_delete_forgets_name() {
    let engine = setup(config(1, 2));
    post(&engine, 1);
    post(&engine, 2);
    engine.flush_open_chapter().unwrap();
    post(&engine, 3);

    assert!(run(&engine, 2, RequestKind::Delete, 0).found);
    assert!(run(&engine, 3, RequestKind::Delete, 0).found);
    assert!(!run(&engine, 4, RequestKind::Delete, 0).found);

    assert!(query(&engine, 1).found);
    assert!(!query(&engine, 2).found);
    assert!(!query(&engine, 3).found);
    assert_eq!(engine.stats().deletes, 3);
}

// =============================================================================
// Chapter Rotation Tests
// =============================================================================

#[test]
fn test_full_open_chapter_closes() {
    let engine = setup(config(1, 2));
    let per_chapter = u64::from(engine.geometry().records_per_chapter);
    for i in 0..2 * per_chapter + 44 {
        post(&engine, i);
    }

    let stats = engine.stats();
    assert_eq!(stats.open_chapter, 2);
    assert_eq!(stats.open_chapter_records, 44);
    for i in 0..2 * per_chapter + 44 {
        let response = query(&engine, i);
        assert!(response.found, "name {}", i);
        assert_eq!(response.virtual_chapter, Some(i / per_chapter));
    }
}

#[test]
fn test_oldest_chapter_expires() {
    let engine = setup(config(1, 2));
    post(&engine, 1);
    for _ in 0..7 {
        engine.flush_open_chapter().unwrap();
    }
    assert_eq!(query(&engine, 1).virtual_chapter, Some(0));

    engine.flush_open_chapter().unwrap();
    let stats = engine.stats();
    assert_eq!(stats.open_chapter, 8);
    assert_eq!(stats.oldest_chapter, 0);
    assert!(!query(&engine, 1).found);
}

#[test]
fn test_names_survive_many_rotations() {
    let engine = setup(config(2, 2));
    for i in 0..3000 {
        post(&engine, i);
    }
    let open = engine.stats().open_chapter;
    assert!(open > 8);

    let mut found = 0;
    for i in 0..3000 {
        let response = query(&engine, i);
        if let Some(chapter) = response.virtual_chapter {
            assert!(chapter + 8 > open, "name {} in expired chapter {}", i, chapter);
            found += 1;
        }
    }
    // The newest chapters are all still searchable
    assert!(found >= 7 * 64);
}

// =============================================================================
// Asynchronous Search Tests
// =============================================================================

#[test]
fn test_query_parks_until_pages_are_read() {
    let engine = setup(config(1, 2));
    post(&engine, 5);
    engine.flush_open_chapter().unwrap();

    let request = engine.request(1, name(5), RequestKind::Query);
    assert_eq!(engine.execute(&request).unwrap(), Outcome::Queued);

    let restarts = engine.restarts(request.zone).unwrap();
    let response = loop {
        let restart = restarts.recv().unwrap();
        assert_eq!(restart.request.id, 1);
        restart.status.unwrap();
        match engine.execute(&restart.request).unwrap() {
            Outcome::Completed(response) => break response,
            Outcome::Queued => continue,
            Outcome::Busy => panic!("queue should not be full"),
        }
    };
    assert!(response.found);
    assert_eq!(response.virtual_chapter, Some(0));
    assert!(engine.stats().cache.queued_reads >= 2);
}

#[test]
fn test_locked_mode_searches_synchronously() {
    let engine = setup(config(2, 0));
    for i in 0..300 {
        post(&engine, i);
    }
    engine.flush_open_chapter().unwrap();

    for i in 0..300 {
        let request = engine.request(i, name(i), RequestKind::Query);
        match engine.execute(&request).unwrap() {
            Outcome::Completed(response) => assert!(response.found, "name {}", i),
            other => panic!("expected completion, got {:?}", other),
        }
    }
    assert_eq!(engine.stats().cache.queued_reads, 0);
}

#[test]
fn test_zones_run_concurrently() {
    let engine = setup(config(2, 2));
    let mut per_zone: Vec<Vec<u64>> = vec![Vec::new(); 2];
    for i in 0..1000 {
        per_zone[engine.zone_for_name(&name(i)) as usize].push(i);
    }
    assert!(per_zone.iter().all(|names| !names.is_empty()));

    thread::scope(|scope| {
        for names in &per_zone {
            let engine = &engine;
            scope.spawn(move || {
                for &i in names {
                    post(engine, i);
                }
                for &i in names {
                    assert!(query(engine, i).found, "name {}", i);
                }
            });
        }
    });
    assert_eq!(engine.stats().posts, 1000);
}

// =============================================================================
// Sparse Index Tests
// =============================================================================

#[test]
fn test_sparse_chapters_keep_sampled_names() {
    let engine = setup(sparse_config());
    fill_sparse_chapter(&engine);
    let (hooks, others) = split_hooks();
    assert!(!hooks.is_empty() && !others.is_empty());

    // Until a hook leads to chapter 0 its other names are not searched
    assert!(others.iter().all(|&i| !query(&engine, i).found));
    for &i in &hooks {
        let response = query(&engine, i);
        assert!(response.found, "hook {}", i);
        assert_eq!(response.virtual_chapter, Some(0));
    }
    assert!(engine.stats().volume_index.sparse.record_count > 0);
}

#[test]
fn test_hook_hit_finds_other_names_in_sparse_chapter() {
    let engine = setup(sparse_config());
    fill_sparse_chapter(&engine);
    let (hooks, others) = split_hooks();

    assert!(query(&engine, hooks[0]).found);
    assert_eq!(engine.stats().sparse_cached_chapters, 1);
    for &i in &others {
        let response = query(&engine, i);
        assert!(response.found, "name {}", i);
        assert_eq!(response.virtual_chapter, Some(0));
        assert_eq!(response.old_metadata, Some(RecordData::from_u64(i)));
    }
    assert_eq!(engine.stats().found_in_sparse_chapter, others.len() as u64);
    assert!(!query(&engine, 10_000).found);

    // Posting a name found this way brings it back into the open chapter
    let response = post(&engine, others[0]);
    assert_eq!(response.virtual_chapter, Some(0));
    assert_eq!(query(&engine, others[0]).virtual_chapter, Some(9));
}

// =============================================================================
// Save and Load Tests
// =============================================================================

#[test]
fn test_save_and_load_with_other_zone_count() {
    let saved_config = config(2, 2);
    let storage = memory_storage(&saved_config);
    let before = {
        let engine = Engine::create_with_storage(saved_config, Arc::clone(&storage)).unwrap();
        for i in 0..400 {
            post(&engine, i);
        }
        engine.flush_open_chapter().unwrap();
        // Few enough open records that no zone of three is over its share
        for i in 400..420 {
            post(&engine, i);
        }
        engine.save().unwrap();
        engine.stats()
    };

    let engine = Engine::load_with_storage(config(3, 2), storage).unwrap();
    assert_eq!(engine.zone_count(), 3);
    let after = engine.stats();
    assert_eq!(after.open_chapter, before.open_chapter);
    assert_eq!(after.open_chapter_records, 20);
    assert_eq!(
        after.volume_index.combined().record_count,
        before.volume_index.combined().record_count
    );
    for i in 0..420 {
        assert!(query(&engine, i).found, "name {}", i);
    }

    // The loaded index keeps accepting new names
    post(&engine, 10_000);
    assert!(query(&engine, 10_000).found);
}

#[test]
fn test_load_rejects_other_index() {
    let saved_config = config(1, 2);
    let storage = memory_storage(&saved_config);
    {
        let engine = Engine::create_with_storage(saved_config, Arc::clone(&storage)).unwrap();
        post(&engine, 1);
        engine.save().unwrap();
    }

    let mut other = config(1, 2);
    other.nonce = 7;
    let err = Engine::load_with_storage(other, storage).err().unwrap();
    assert!(err.is_format());
}

#[test]
fn test_load_of_unsaved_index_fails() {
    let config = config(1, 2);
    let storage = memory_storage(&config);
    drop(Engine::create_with_storage(config.clone(), Arc::clone(&storage)).unwrap());
    assert!(Engine::load_with_storage(config, storage).is_err());
}

// =============================================================================
// Contract Tests
// =============================================================================

#[test]
fn test_request_for_wrong_zone_is_rejected() {
    let engine = setup(config(2, 2));
    let n = name(1);
    let wrong = 1 - engine.zone_for_name(&n);
    let request = Request::new(1, n, wrong, RequestKind::Post);
    assert!(matches!(engine.execute(&request), Err(IndexError::InvalidArgument(_))));
    assert!(engine.restarts(2).is_err());
}

#[test]
fn test_requests_after_shutdown_fail() {
    let engine = setup(config(1, 2));
    post(&engine, 1);
    engine.shutdown();
    engine.shutdown();

    let request = engine.request(2, name(2), RequestKind::Post);
    assert!(matches!(engine.execute(&request), Err(IndexError::Shutdown)));
}

#[test]
fn test_undersized_storage_is_rejected() {
    let config = config(1, 2);
    let blocks = Engine::required_blocks(&config).unwrap();
    let storage: Arc<dyn BlockStorage> = Arc::new(MemoryStorage::new(blocks - 1));
    assert!(matches!(
        Engine::create_with_storage(config, storage),
        Err(IndexError::Config(_))
    ));
}
