use std::sync::Arc;
use std::thread;

use entitycache::{
    CacheConcurrencyStrategy, CacheCoordinator, CacheError, EntityHandle, EntityState, Error,
    Metamodel, RegionConfig, RegionFactory, RegionKey, RegionKind, RegionStorage, RowStoreDriver,
    Settings, Slot,
};
use rowstore::{Column, IdGeneration, Relation, RowStore, Schema, TableSchema, Value};
use tempfile::TempDir;

const POST_DETAILS_QUERY: &str = "select p from Post p join fetch p.details where p.id = :id";
const POST_GRAPH_QUERY: &str =
    "select p from Post p join fetch p.details join fetch p.comments where p.id = :id";

fn schema() -> Schema {
    Schema::new(vec![
        TableSchema::new("Post")
            .id_generation(IdGeneration::Sequence)
            .column(Column::text("name"))
            .relation(Relation::one("details", "PostDetails", "post"))
            .relation(Relation::many("comments", "Comment", "post")),
        TableSchema::new("PostDetails")
            .id_generation(IdGeneration::Shared {
                column: "post".into(),
            })
            .column(Column::timestamp("created_on"))
            .column(Column::reference("post", "Post").not_null()),
        TableSchema::new("Comment")
            .id_generation(IdGeneration::Sequence)
            .column(Column::text("review"))
            .column(Column::reference("post", "Post")),
    ])
    .unwrap()
}

fn metamodel() -> Metamodel {
    let strategy = CacheConcurrencyStrategy::NonstrictReadWrite;
    Metamodel::new(schema())
        .cache("Post", strategy)
        .unwrap()
        .cache("PostDetails", strategy)
        .unwrap()
        .cache("Comment", strategy)
        .unwrap()
}

struct Fixture {
    _dir: TempDir,
    store: RowStore,
    coordinator: Arc<CacheCoordinator>,
}

/// Post 1 "Hibernate Master Class" with details 1 and comments 2 and 3,
/// counters reset afterwards
fn fixture(settings: Settings) -> Fixture {
    let dir = TempDir::new().unwrap();
    let store = RowStore::open(dir.path(), schema()).unwrap();
    let coordinator =
        CacheCoordinator::new(settings, metamodel(), Arc::new(RowStoreDriver::new(store.clone()))).unwrap();

    let mut session = coordinator.open_session().unwrap();
    let post = session.instantiate("Post").unwrap();
    post.set("name", "Hibernate Master Class").unwrap();
    assert_eq!(session.persist(&post).unwrap().id, 1);

    let details = session.instantiate("PostDetails").unwrap();
    details
        .set("created_on", Value::Timestamp(1_700_000_000_000))
        .unwrap();
    details.set_reference("post", Some(&post)).unwrap();
    assert_eq!(session.persist(&details).unwrap().id, 1);

    for (review, id) in [("Excellent!", 2), ("Great!", 3)] {
        add_comment(&mut session, &post, review, id);
    }
    session.commit().unwrap();

    coordinator.statistics().reset();
    store.stats().reset();
    Fixture {
        _dir: dir,
        store,
        coordinator,
    }
}

fn add_comment(session: &mut entitycache::Session, post: &EntityHandle, review: &str, expected_id: u64) {
    let comment = session.instantiate("Comment").unwrap();
    comment.set("review", review).unwrap();
    comment.set_reference("post", Some(post)).unwrap();
    assert_eq!(session.persist(&comment).unwrap().id, expected_id);
}

fn query_cached() -> Settings {
    Settings::default().with_query_cache(true)
}

/// Load Post 1 in its own session so that it lands in L2
fn warm_post(fx: &Fixture) {
    let mut session = fx.coordinator.open_session().unwrap();
    session.load("Post", 1).unwrap();
    session.commit().unwrap();
}

fn run_cached(fx: &Fixture, text: &str, id: u64) -> Vec<EntityHandle> {
    let mut session = fx.coordinator.open_session().unwrap();
    let result = session
        .create_query(text)
        .set_parameter("id", Value::from_id(id))
        .set_cacheable(true)
        .list()
        .unwrap();
    session.commit().unwrap();
    result
}

#[test]
fn test_s1_second_session_reads_from_cache() {
    let fx = fixture(Settings::default());

    for _ in 0..2 {
        let mut session = fx.coordinator.open_session().unwrap();
        let post = session.load("Post", 1).unwrap();
        assert_eq!(post.get("name").unwrap(), Value::from("Hibernate Master Class"));
        assert_eq!(post.relation_ids("comments").unwrap(), vec![2, 3]);
        session.commit().unwrap();
    }

    assert_eq!(fx.store.stats().selects("Post"), 1);
    let stats = fx.coordinator.statistics().snapshot();
    assert_eq!(stats.entity_fetches, 1);
    assert_eq!(stats.second_level_misses, 1);
    assert_eq!(stats.second_level_hits, 1);
    assert!(fx.coordinator.contains_entity("Post", 1).unwrap());
}

#[test]
fn test_s2_update_misses_query_cache() {
    let fx = fixture(query_cached());
    warm_post(&fx);

    let mut session = fx.coordinator.open_session().unwrap();
    let post = session.load("Post", 1).unwrap();
    post.set("name", "High-Performance Hibernate").unwrap();
    session.commit().unwrap();
    assert!(!fx.coordinator.contains_entity("Post", 1).unwrap());

    let queries = fx.store.stats().queries();
    let result = run_cached(&fx, POST_DETAILS_QUERY, 1);
    assert_eq!(result.len(), 1);
    assert_eq!(
        result[0].get("name").unwrap(),
        Value::from("High-Performance Hibernate")
    );

    let stats = fx.coordinator.statistics().snapshot();
    assert_eq!(stats.query_cache_misses, 1);
    assert_eq!(stats.query_cache_puts, 1);
    assert_eq!(fx.store.stats().queries(), queries + 1);

    // Now served without the store
    let result = run_cached(&fx, POST_DETAILS_QUERY, 1);
    assert_eq!(result[0].id(), Some(1));
    assert_eq!(fx.coordinator.statistics().snapshot().query_cache_hits, 1);
    assert_eq!(fx.store.stats().queries(), queries + 1);
}

#[test]
fn test_s3_insert_invalidates_cached_query() {
    let fx = fixture(query_cached());
    warm_post(&fx);

    run_cached(&fx, POST_GRAPH_QUERY, 1);
    run_cached(&fx, POST_GRAPH_QUERY, 1);
    let stats = fx.coordinator.statistics().snapshot();
    assert_eq!(stats.query_cache_misses, 1);
    assert_eq!(stats.query_cache_hits, 1);
    assert_eq!(fx.store.stats().queries(), 1);

    let mut session = fx.coordinator.open_session().unwrap();
    let book = session.instantiate("Post").unwrap();
    book.set("name", "Hibernate Book!").unwrap();
    session.persist(&book).unwrap();
    session.commit().unwrap();

    let result = run_cached(&fx, POST_GRAPH_QUERY, 1);
    assert_eq!(result.len(), 1);
    assert_eq!(result[0].get("name").unwrap(), Value::from("Hibernate Master Class"));

    let stats = fx.coordinator.statistics().snapshot();
    assert_eq!(stats.query_cache_misses, 2);
    assert_eq!(stats.query_cache_puts, 2);
    assert_eq!(fx.store.stats().queries(), 2);

    // An unrelated insert leaves the direct-id entry alone
    assert!(fx.coordinator.contains_entity("Post", 1).unwrap());
}

#[test]
fn test_s4_flush_keeps_identity_and_cached_sibling() {
    let fx = fixture(Settings::default());

    let mut first = fx.coordinator.open_session().unwrap();
    first.load("Comment", 2).unwrap();
    first.commit().unwrap();
    assert!(fx.coordinator.contains_entity("Comment", 2).unwrap());

    let mut session = fx.coordinator.open_session().unwrap();
    let comment = session.load("Comment", 2).unwrap();
    let post = session.load("Post", 1).unwrap();
    add_comment(&mut session, &post, "Must read!", 4);
    session.flush().unwrap();

    let hits = fx.coordinator.statistics().snapshot().second_level_hits;
    let again = session.load("Comment", 2).unwrap();
    assert!(again.same_instance(&comment));
    assert_eq!(fx.coordinator.statistics().snapshot().second_level_hits, hits);
    assert_eq!(post.relation_ids("comments").unwrap(), vec![2, 3, 4]);
    session.commit().unwrap();

    assert!(fx.coordinator.contains_entity("Comment", 2).unwrap());
    // The parent's cached comment list went stale
    assert!(!fx.coordinator.contains_entity("Post", 1).unwrap());

    let mut session = fx.coordinator.open_session().unwrap();
    let post = session.load("Post", 1).unwrap();
    let reviews: Vec<_> = session
        .relation(&post, "comments")
        .unwrap()
        .iter()
        .map(|c| c.get("review").unwrap())
        .collect();
    assert_eq!(
        reviews,
        vec![Value::from("Excellent!"), Value::from("Great!"), Value::from("Must read!")]
    );
}

#[test]
fn test_identity_within_a_session() {
    let fx = fixture(query_cached());

    let mut session = fx.coordinator.open_session().unwrap();
    let first = session.load("Post", 1).unwrap();
    let second = session.load("Post", 1).unwrap();
    assert!(first.same_instance(&second));

    let queried = session
        .create_query(POST_DETAILS_QUERY)
        .set_parameter("id", Value::from_id(1))
        .unique_result()
        .unwrap()
        .unwrap();
    assert!(queried.same_instance(&first));

    let details = session.relation(&first, "details").unwrap();
    assert_eq!(details.len(), 1);
    let owner = session.reference(&details[0], "post").unwrap().unwrap();
    assert!(owner.same_instance(&first));
}

#[test]
fn test_update_evicts_and_next_load_reads_store() {
    let fx = fixture(Settings::default());
    warm_post(&fx);
    assert_eq!(fx.store.stats().selects("Post"), 1);

    let mut session = fx.coordinator.open_session().unwrap();
    let post = session.load("Post", 1).unwrap();
    post.set("name", "High-Performance Hibernate").unwrap();
    assert!(session.is_dirty());
    session.commit().unwrap();
    assert_eq!(fx.store.stats().selects("Post"), 1);

    let mut session = fx.coordinator.open_session().unwrap();
    let post = session.load("Post", 1).unwrap();
    assert_eq!(post.get("name").unwrap(), Value::from("High-Performance Hibernate"));
    assert_eq!(fx.store.stats().selects("Post"), 2);
}

#[test]
fn test_update_of_any_row_invalidates_query() {
    let fx = fixture(query_cached());

    run_cached(&fx, "select c from Comment c where c.post = :id", 1);

    let mut session = fx.coordinator.open_session().unwrap();
    let comment = session.load("Comment", 3).unwrap();
    comment.set("review", "Good").unwrap();
    session.commit().unwrap();

    let result = run_cached(&fx, "select c from Comment c where c.post = :id", 1);
    let reviews: Vec<_> = result.iter().map(|c| c.get("review").unwrap()).collect();
    assert_eq!(reviews, vec![Value::from("Excellent!"), Value::from("Good")]);

    let stats = fx.coordinator.statistics().snapshot();
    assert_eq!(stats.query_cache_hits, 0);
    assert_eq!(stats.query_cache_misses, 2);
}

#[test]
fn test_delete_evicts_entity_and_parent() {
    let fx = fixture(Settings::default());
    warm_post(&fx);
    let mut session = fx.coordinator.open_session().unwrap();
    session.load("Comment", 3).unwrap();
    session.commit().unwrap();
    assert!(fx.coordinator.contains_entity("Comment", 3).unwrap());

    let mut session = fx.coordinator.open_session().unwrap();
    let comment = session.load("Comment", 3).unwrap();
    session.remove(&comment).unwrap();
    assert_eq!(comment.state(), EntityState::Removed);
    assert!(session.get("Comment", 3).unwrap().is_none());
    session.commit().unwrap();

    assert!(!fx.coordinator.contains_entity("Comment", 3).unwrap());
    assert!(!fx.coordinator.contains_entity("Post", 1).unwrap());

    let mut session = fx.coordinator.open_session().unwrap();
    assert!(session.get("Comment", 3).unwrap().is_none());
    assert!(matches!(session.load("Comment", 3), Err(Error::NotFound(_))));
    let post = session.load("Post", 1).unwrap();
    assert_eq!(post.relation_ids("comments").unwrap(), vec![2]);
}

#[test]
fn test_abort_leaves_no_trace() {
    let fx = fixture(query_cached());
    warm_post(&fx);
    run_cached(&fx, POST_DETAILS_QUERY, 1);

    let mut session = fx.coordinator.open_session().unwrap();
    let post = session.load("Post", 1).unwrap();
    post.set("name", "Never committed").unwrap();
    session.flush().unwrap();
    session.rollback();
    assert_eq!(post.state(), EntityState::Detached);

    let before = fx.coordinator.statistics().snapshot();
    let mut session = fx.coordinator.open_session().unwrap();
    let post = session.load("Post", 1).unwrap();
    assert_eq!(post.get("name").unwrap(), Value::from("Hibernate Master Class"));
    session.commit().unwrap();

    let after = fx.coordinator.statistics().snapshot();
    assert_eq!(after.second_level_hits, before.second_level_hits + 1);
    assert_eq!(after.entity_fetches, before.entity_fetches);
    assert_eq!(after.rollbacks, 1);

    // The aborted write released its in-flight marker
    let queries = fx.store.stats().queries();
    run_cached(&fx, POST_DETAILS_QUERY, 1);
    assert_eq!(fx.store.stats().queries(), queries);
}

#[test]
fn test_dropped_session_rolls_back() {
    let fx = fixture(Settings::default());
    {
        let mut session = fx.coordinator.open_session().unwrap();
        let post = session.instantiate("Post").unwrap();
        post.set("name", "Dropped").unwrap();
        session.persist(&post).unwrap();
        session.flush().unwrap();
    }
    assert_eq!(fx.coordinator.statistics().snapshot().rollbacks, 1);
    assert_eq!(fx.store.row_count("Post"), 1);
}

#[test]
fn test_uncommitted_writes_never_reach_query_cache() {
    let fx = fixture(query_cached());
    let text = "select p from Post p where p.name = :name";

    let mut session = fx.coordinator.open_session().unwrap();
    let draft = session.instantiate("Post").unwrap();
    draft.set("name", "Draft").unwrap();
    session.persist(&draft).unwrap();
    let found = session
        .create_query(text)
        .set_parameter("name", "Draft")
        .set_cacheable(true)
        .list()
        .unwrap();
    assert_eq!(found.len(), 1);
    assert!(found[0].same_instance(&draft));
    assert_eq!(fx.coordinator.statistics().snapshot().query_cache_puts, 0);
    session.rollback();

    let mut session = fx.coordinator.open_session().unwrap();
    let found = session
        .create_query(text)
        .set_parameter("name", "Draft")
        .set_cacheable(true)
        .list()
        .unwrap();
    assert!(found.is_empty());
    assert_eq!(fx.coordinator.statistics().snapshot().query_cache_puts, 0);
    session.commit().unwrap();
    assert_eq!(fx.coordinator.statistics().snapshot().query_cache_puts, 1);
}

#[test]
fn test_rolled_back_reads_stay_out_of_second_level_cache() {
    let fx = fixture(query_cached());

    let mut session = fx.coordinator.open_session().unwrap();
    session.load("Comment", 3).unwrap();
    session
        .create_query(POST_DETAILS_QUERY)
        .set_parameter("id", Value::from_id(1))
        .set_cacheable(true)
        .list()
        .unwrap();
    session.rollback();

    assert!(!fx.coordinator.contains_entity("Comment", 3).unwrap());
    assert!(!fx.coordinator.contains_entity("Post", 1).unwrap());
    let stats = fx.coordinator.statistics().snapshot();
    assert_eq!(stats.second_level_puts, 0);
    assert_eq!(stats.query_cache_puts, 0);

    // The next unit of work reads the store again, then publishes at commit
    let mut session = fx.coordinator.open_session().unwrap();
    session.load("Comment", 3).unwrap();
    assert!(!fx.coordinator.contains_entity("Comment", 3).unwrap());
    session.commit().unwrap();

    let after = fx.coordinator.statistics().snapshot();
    assert_eq!(after.second_level_hits, 0);
    assert_eq!(after.entity_fetches, 2);
    assert_eq!(fx.store.stats().selects("Comment"), 2);
    assert!(fx.coordinator.contains_entity("Comment", 3).unwrap());
}

#[test]
fn test_dropped_reader_leaves_no_cache_entries() {
    let fx = fixture(Settings::default());
    {
        let mut session = fx.coordinator.open_session().unwrap();
        session.load("Post", 1).unwrap();
    }
    assert!(!fx.coordinator.contains_entity("Post", 1).unwrap());
    assert_eq!(fx.coordinator.statistics().snapshot().rollbacks, 1);
}

#[test]
fn test_cached_result_with_evicted_entity_is_rebuilt() {
    let fx = fixture(query_cached());
    run_cached(&fx, POST_GRAPH_QUERY, 1);

    fx.coordinator.evict_entity("Comment", 2).unwrap();
    let queries = fx.store.stats().queries();
    let result = run_cached(&fx, POST_GRAPH_QUERY, 1);
    assert_eq!(result.len(), 1);
    assert_eq!(fx.store.stats().queries(), queries + 1);
    assert!(fx.coordinator.contains_entity("Comment", 2).unwrap());
}

#[test]
fn test_store_conflict_aborts_without_cache_changes() {
    let fx = fixture(query_cached());
    warm_post(&fx);

    let mut session = fx.coordinator.open_session().unwrap();
    let orphan = session.instantiate("Comment").unwrap();
    orphan.set("review", "Orphan").unwrap();
    orphan.set("post", Value::from_id(99)).unwrap();
    session.persist(&orphan).unwrap();
    let err = session.commit().unwrap_err();
    assert!(matches!(err, Error::StoreConflict(_)));

    assert!(fx.coordinator.contains_entity("Post", 1).unwrap());
    let stats = fx.coordinator.statistics().snapshot();
    assert_eq!(stats.rollbacks, 1);
    assert_eq!(stats.commits, 1);
}

#[test]
fn test_failed_commit_restores_locked_entries() {
    let fx = fixture(Settings::default());

    let mut loser = fx.coordinator.open_session().unwrap();
    let comment = loser.load("Comment", 3).unwrap();
    loser.remove(&comment).unwrap();
    loser.flush().unwrap();

    let mut winner = fx.coordinator.open_session().unwrap();
    let comment = winner.load("Comment", 3).unwrap();
    winner.remove(&comment).unwrap();
    winner.commit().unwrap();

    warm_post(&fx);
    assert!(fx.coordinator.contains_entity("Post", 1).unwrap());

    let err = loser.commit().unwrap_err();
    assert!(matches!(err, Error::StoreConflict(_)));
    assert!(fx.coordinator.contains_entity("Post", 1).unwrap());
    assert_eq!(fx.coordinator.statistics().snapshot().rollbacks, 1);
}

#[test]
fn test_closed_session_rejects_work() {
    let fx = fixture(Settings::default());
    let mut session = fx.coordinator.open_session().unwrap();
    let orphan = session.instantiate("Comment").unwrap();
    orphan.set("review", "Orphan").unwrap();
    orphan.set("post", Value::from_id(99)).unwrap();
    session.persist(&orphan).unwrap();

    assert!(session.flush().is_err());
    assert!(!session.is_open());
    assert!(matches!(session.load("Post", 1), Err(Error::SessionClosed)));
}

#[test]
fn test_unique_result_rejects_many_rows() {
    let fx = fixture(Settings::default());
    let mut session = fx.coordinator.open_session().unwrap();

    let err = session
        .create_query("select c from Comment c where c.post = :id")
        .set_parameter("id", Value::from_id(1))
        .unique_result()
        .unwrap_err();
    assert!(matches!(err, Error::NonUniqueResult(2)));

    let none = session
        .create_query("select p from Post p where p.id = :id")
        .set_parameter("id", Value::from_id(42))
        .unique_result()
        .unwrap();
    assert!(none.is_none());
}

#[test]
fn test_persist_errors() {
    let fx = fixture(Settings::default());
    let mut session = fx.coordinator.open_session().unwrap();

    let details = session.instantiate("PostDetails").unwrap();
    assert!(matches!(session.persist(&details), Err(Error::MissingId(_))));

    let post = session.load("Post", 1).unwrap();
    session.load("PostDetails", 1).unwrap();
    details.set_reference("post", Some(&post)).unwrap();
    assert!(matches!(
        session.persist(&details),
        Err(Error::DuplicateInstance(_))
    ));

    let ghost = session.instantiate("Post").unwrap();
    assert!(matches!(session.remove(&ghost), Err(Error::NotManaged(_))));
    assert!(matches!(
        session.instantiate("Tag"),
        Err(Error::UnknownEntity(_))
    ));
}

#[test]
fn test_evict_all_regions() {
    let fx = fixture(query_cached());
    warm_post(&fx);
    run_cached(&fx, POST_DETAILS_QUERY, 1);

    fx.coordinator.evict_all_regions();
    assert!(!fx.coordinator.contains_entity("Post", 1).unwrap());
    assert!(fx.coordinator.regions().regions().iter().all(|r| r.is_empty()));

    let queries = fx.store.stats().queries();
    run_cached(&fx, POST_DETAILS_QUERY, 1);
    assert_eq!(fx.store.stats().queries(), queries + 1);

    let names: Vec<_> = fx
        .coordinator
        .region_stats()
        .into_iter()
        .map(|r| (r.name, r.kind))
        .collect();
    assert!(names.contains(&("entity.Post".to_string(), RegionKind::Entity)));
    assert!(names.contains(&(
        entitycache::QUERY_RESULTS_REGION.to_string(),
        RegionKind::Query
    )));
    assert!(names.contains(&(
        entitycache::UPDATE_TIMESTAMPS_REGION.to_string(),
        RegionKind::Timestamps
    )));
}

#[test]
fn test_size_bounded_region() {
    let fx = fixture(Settings::default().with_region("entity.Comment", RegionConfig::bounded(1)));

    let mut session = fx.coordinator.open_session().unwrap();
    session.load("Comment", 2).unwrap();
    session.load("Comment", 3).unwrap();
    session.commit().unwrap();

    assert!(!fx.coordinator.contains_entity("Comment", 2).unwrap());
    assert!(fx.coordinator.contains_entity("Comment", 3).unwrap());
}

#[test]
fn test_disabled_second_level_cache() {
    let fx = fixture(Settings::default().with_second_level_cache(false));
    warm_post(&fx);
    warm_post(&fx);

    assert_eq!(fx.store.stats().selects("Post"), 2);
    assert!(!fx.coordinator.contains_entity("Post", 1).unwrap());
    assert!(CacheCoordinator::new(
        Settings::default()
            .with_second_level_cache(false)
            .with_query_cache(true),
        metamodel(),
        Arc::new(RowStoreDriver::new(fx.store.clone())),
    )
    .is_err());
}

struct OfflineFactory;

struct OfflineStorage;

fn offline() -> CacheError {
    CacheError::Unavailable {
        region: "offline".to_string(),
        reason: "connection refused".to_string(),
    }
}

impl RegionStorage for OfflineStorage {
    fn get(&self, _key: &RegionKey) -> Result<Option<Slot>, CacheError> {
        Err(offline())
    }

    fn put(&self, _key: RegionKey, _slot: Slot) -> Result<usize, CacheError> {
        Err(offline())
    }

    fn remove(&self, _key: &RegionKey) -> Result<Option<Slot>, CacheError> {
        Err(offline())
    }

    fn clear(&self) -> Result<usize, CacheError> {
        Err(offline())
    }

    fn len(&self) -> usize {
        0
    }
}

impl RegionFactory for OfflineFactory {
    fn name(&self) -> &str {
        "offline"
    }

    fn build(&self, _region: &str, _config: &RegionConfig) -> Result<Box<dyn RegionStorage>, CacheError> {
        Ok(Box::new(OfflineStorage))
    }
}

#[test]
fn test_unavailable_cache_degrades_to_store() {
    let fx = fixture(query_cached().with_region_factory(Arc::new(OfflineFactory)));

    warm_post(&fx);
    warm_post(&fx);
    assert_eq!(fx.store.stats().selects("Post"), 2);

    let mut session = fx.coordinator.open_session().unwrap();
    let post = session.load("Post", 1).unwrap();
    post.set("name", "High-Performance Hibernate").unwrap();
    session.commit().unwrap();

    let result = run_cached(&fx, POST_DETAILS_QUERY, 1);
    assert_eq!(result[0].get("name").unwrap(), Value::from("High-Performance Hibernate"));
    run_cached(&fx, POST_DETAILS_QUERY, 1);
    assert_eq!(fx.store.stats().queries(), 2);
    assert_eq!(fx.coordinator.statistics().snapshot().query_cache_hits, 0);
}

#[test]
fn test_concurrent_sessions_share_second_level_cache() {
    let fx = fixture(Settings::default());
    warm_post(&fx);

    let handles: Vec<_> = (0..4)
        .map(|_| {
            let coordinator = fx.coordinator.clone();
            thread::spawn(move || {
                for _ in 0..25 {
                    let mut session = coordinator.open_session().unwrap();
                    let post = session.load("Post", 1).unwrap();
                    assert_eq!(post.get("name").unwrap(), Value::from("Hibernate Master Class"));
                    session.commit().unwrap();
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(fx.store.stats().selects("Post"), 1);
    assert_eq!(fx.coordinator.statistics().snapshot().second_level_hits, 100);
}

#[test]
fn test_concurrent_writer_never_leaves_stale_entry() {
    let fx = fixture(Settings::default());
    warm_post(&fx);

    let writer = {
        let coordinator = fx.coordinator.clone();
        thread::spawn(move || {
            for i in 0..20i64 {
                let mut session = coordinator.open_session().unwrap();
                let post = session.load("Post", 1).unwrap();
                post.set("name", format!("revision {}", i)).unwrap();
                session.commit().unwrap();
            }
        })
    };
    let readers: Vec<_> = (0..3)
        .map(|_| {
            let coordinator = fx.coordinator.clone();
            thread::spawn(move || {
                for _ in 0..50 {
                    let mut session = coordinator.open_session().unwrap();
                    session.load("Post", 1).unwrap();
                    session.commit().unwrap();
                }
            })
        })
        .collect();
    writer.join().unwrap();
    for reader in readers {
        reader.join().unwrap();
    }

    // A session started after the last commit sees the last revision
    let mut session = fx.coordinator.open_session().unwrap();
    let post = session.load("Post", 1).unwrap();
    assert_eq!(post.get("name").unwrap(), Value::from("revision 19"));
}
