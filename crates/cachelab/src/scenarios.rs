//! Post / PostDetails / Comment scenarios
//!
//! Every scenario builds a fresh fixture in its own directory, replays the
//! two cold/warm loads of Post 1 and then exercises one cache behaviour.
//! Expectations are recorded as checks rather than asserted so that a run
//! with caching switched off still produces a full report.

use std::path::Path;
use std::sync::Arc;

use anyhow::{ensure, Context, Result};
use chrono::{TimeZone, Utc};
use clap::ValueEnum;
use entitycache::{
    CacheConcurrencyStrategy, CacheCoordinator, EntityHandle, Metamodel, RegionStatistics,
    RowStoreDriver, Session, Settings, StatisticsSnapshot,
};
use rowstore::{Column, IdGeneration, Relation, RowStore, Schema, TableSchema, Value};
use serde::Serialize;
use tracing::{debug, info};

const POST_DETAILS_QUERY: &str = "select p from Post p join fetch p.details where p.id = :id";
const POST_GRAPH_QUERY: &str =
    "select p from Post p join fetch p.details join fetch p.comments where p.id = :id";

const TABLES: [&str; 3] = ["Post", "PostDetails", "Comment"];

/// Selectable scenario
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Scenario {
    /// Second session reads Post 1 from the entity cache
    S1,
    /// Cached query after an update of Post 1
    S2,
    /// Cached query after an unrelated Post insert
    S3,
    /// Flush inside a session keeps identity and the cached sibling
    S4,
}

impl Scenario {
    /// All scenarios in run order
    pub const ALL: [Scenario; 4] = [Scenario::S1, Scenario::S2, Scenario::S3, Scenario::S4];

    /// Short name, also the data subdirectory
    pub fn name(self) -> &'static str {
        match self {
            Scenario::S1 => "s1",
            Scenario::S2 => "s2",
            Scenario::S3 => "s3",
            Scenario::S4 => "s4",
        }
    }

    /// One line summary
    pub fn description(self) -> &'static str {
        match self {
            Scenario::S1 => "second unit of work loads Post 1 from the entity cache",
            Scenario::S2 => "updated Post 1 is queried through the query cache",
            Scenario::S3 => "inserting another Post invalidates the cached Post graph query",
            Scenario::S4 => "flushing a new Comment keeps Comment 2 in L1 and L2",
        }
    }
}

/// One expectation of a scenario
#[derive(Debug, Clone, Serialize)]
pub struct Check {
    pub name: String,
    pub expected: String,
    pub actual: String,
    pub passed: bool,
}

/// Row store counters after a scenario
#[derive(Debug, Clone, Default, Serialize)]
pub struct StoreReport {
    pub post_selects: u64,
    pub post_details_selects: u64,
    pub comment_selects: u64,
    pub queries: u64,
    pub inserts: u64,
    pub updates: u64,
    pub deletes: u64,
    pub commits: u64,
    pub rows: usize,
}

/// Coordinator counters after a scenario
#[derive(Debug, Clone, Default, Serialize)]
pub struct CacheReport {
    pub second_level_hits: u64,
    pub second_level_misses: u64,
    pub second_level_puts: u64,
    pub query_cache_hits: u64,
    pub query_cache_misses: u64,
    pub query_cache_puts: u64,
    pub entity_fetches: u64,
    pub query_executions: u64,
    pub commits: u64,
    pub rollbacks: u64,
}

impl From<StatisticsSnapshot> for CacheReport {
    fn from(stats: StatisticsSnapshot) -> Self {
        Self {
            second_level_hits: stats.second_level_hits,
            second_level_misses: stats.second_level_misses,
            second_level_puts: stats.second_level_puts,
            query_cache_hits: stats.query_cache_hits,
            query_cache_misses: stats.query_cache_misses,
            query_cache_puts: stats.query_cache_puts,
            entity_fetches: stats.entity_fetches,
            query_executions: stats.query_executions,
            commits: stats.commits,
            rollbacks: stats.rollbacks,
        }
    }
}

/// Counters of one cache region
#[derive(Debug, Clone, Serialize)]
pub struct RegionReport {
    pub name: String,
    pub kind: String,
    pub entries: usize,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub inserts: u64,
    pub hit_ratio: f64,
}

impl From<RegionStatistics> for RegionReport {
    fn from(stats: RegionStatistics) -> Self {
        Self {
            hit_ratio: stats.hit_ratio(),
            kind: format!("{:?}", stats.kind).to_lowercase(),
            name: stats.name,
            entries: stats.entries,
            hits: stats.hits,
            misses: stats.misses,
            evictions: stats.evictions,
            inserts: stats.inserts,
        }
    }
}

/// Outcome of one scenario
#[derive(Debug, Clone, Serialize)]
pub struct ScenarioReport {
    pub scenario: Scenario,
    pub description: String,
    pub checks: Vec<Check>,
    pub store: StoreReport,
    pub cache: CacheReport,
    pub regions: Vec<RegionReport>,
}

impl ScenarioReport {
    /// Whether every check held
    pub fn passed(&self) -> bool {
        self.checks.iter().all(|c| c.passed)
    }
}

/// Blog schema: Post 1-1 PostDetails (shared id), Post 1-n Comment
pub fn schema() -> Result<Schema> {
    let schema = Schema::new(vec![
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
    ])?;
    Ok(schema)
}

/// Every entity type cached with nonstrict read-write
pub fn metamodel() -> Result<Metamodel> {
    let strategy = CacheConcurrencyStrategy::NonstrictReadWrite;
    let metamodel = Metamodel::new(schema()?)
        .cache("Post", strategy)?
        .cache("PostDetails", strategy)?
        .cache("Comment", strategy)?;
    Ok(metamodel)
}

/// Runs scenarios against fresh stores under one data directory
pub struct Runner {
    settings: Settings,
    created_on: i64,
}

impl Runner {
    /// Scenarios use `settings` and stamp PostDetails with the current time
    pub fn new(settings: Settings) -> Self {
        Self {
            settings,
            created_on: Utc::now().timestamp_millis(),
        }
    }

    /// Pin the PostDetails creation time
    pub fn with_created_on(mut self, millis: i64) -> Self {
        self.created_on = millis;
        self
    }

    /// Run one scenario in `dir`, which must not hold a store yet
    pub fn run(&self, scenario: Scenario, dir: &Path) -> Result<ScenarioReport> {
        let lab = Lab::open(dir, self.settings.clone(), self.created_on)
            .with_context(|| format!("Failed to set up {}", scenario.name()))?;
        info!(scenario = scenario.name(), dir = %dir.display(), "running scenario");

        let mut checks = Vec::new();
        lab.two_loads(&mut checks)?;
        match scenario {
            Scenario::S1 => {}
            Scenario::S2 => lab.update_then_query(&mut checks)?,
            Scenario::S3 => lab.insert_then_query(&mut checks)?,
            Scenario::S4 => lab.flush_keeps_identity(&mut checks)?,
        }

        let report = lab.report(scenario, checks);
        lab.store.close()?;
        debug!(scenario = scenario.name(), passed = report.passed(), "scenario finished");
        Ok(report)
    }
}

struct Lab {
    store: RowStore,
    coordinator: Arc<CacheCoordinator>,
}

impl Lab {
    /// Post 1 with details 1 and comments 2 and 3, counters reset afterwards
    fn open(dir: &Path, settings: Settings, created_on: i64) -> Result<Self> {
        let store = RowStore::open(dir, schema()?)?;
        ensure!(store.is_empty(), "{} already holds a store", dir.display());
        let coordinator = CacheCoordinator::new(
            settings,
            metamodel()?,
            Arc::new(RowStoreDriver::new(store.clone())),
        )?;

        let mut session = coordinator.open_session()?;
        let post = session.instantiate("Post")?;
        post.set("name", "Hibernate Master Class")?;
        let key = session.persist(&post)?;
        ensure!(key.id == 1, "fixture Post got id {}", key.id);

        let details = session.instantiate("PostDetails")?;
        details.set("created_on", Value::Timestamp(created_on))?;
        details.set_reference("post", Some(&post))?;
        session.persist(&details)?;

        add_comment(&mut session, &post, "Excellent!")?;
        add_comment(&mut session, &post, "Great!")?;
        session.commit()?;

        coordinator.statistics().reset();
        store.stats().reset();
        debug!(
            created_on = %Utc.timestamp_millis_opt(created_on).single().unwrap_or_default(),
            "fixture persisted"
        );
        Ok(Self { store, coordinator })
    }

    /// Load Post 1 in two units of work; one store read in total
    fn two_loads(&self, checks: &mut Vec<Check>) -> Result<()> {
        for _ in 0..2 {
            let mut session = self.coordinator.open_session()?;
            let post = session.load("Post", 1)?;
            ensure!(
                post.get("name")?.as_str() == Some("Hibernate Master Class"),
                "unexpected Post 1 name"
            );
            session.commit()?;
        }
        check(checks, "post selects after two loads", 1, self.store.stats().selects("Post"));
        check(
            checks,
            "second-level hits",
            1,
            self.coordinator.statistics().snapshot().second_level_hits,
        );
        Ok(())
    }

    fn update_then_query(&self, checks: &mut Vec<Check>) -> Result<()> {
        let mut session = self.coordinator.open_session()?;
        let post = session.load("Post", 1)?;
        post.set("name", "High-Performance Hibernate")?;
        session.commit()?;
        check(
            checks,
            "post cached after update",
            false,
            self.coordinator.contains_entity("Post", 1)?,
        );

        let before = self.coordinator.statistics().snapshot();
        let queries = self.store.stats().queries();
        let result = self.cached_query(POST_DETAILS_QUERY)?;
        let name = match result.first() {
            Some(post) => post.get("name")?,
            None => Value::Null,
        };
        check(checks, "queried name", Value::from("High-Performance Hibernate"), name);

        let after = self.coordinator.statistics().snapshot();
        check(
            checks,
            "query cache misses",
            1,
            after.query_cache_misses - before.query_cache_misses,
        );
        check(
            checks,
            "query cache puts",
            1,
            after.query_cache_puts - before.query_cache_puts,
        );
        check(checks, "store queries", 1, self.store.stats().queries() - queries);
        Ok(())
    }

    fn insert_then_query(&self, checks: &mut Vec<Check>) -> Result<()> {
        self.cached_query(POST_GRAPH_QUERY)?;
        self.cached_query(POST_GRAPH_QUERY)?;
        check(
            checks,
            "query cache hits before insert",
            1,
            self.coordinator.statistics().snapshot().query_cache_hits,
        );

        let mut session = self.coordinator.open_session()?;
        let book = session.instantiate("Post")?;
        book.set("name", "Hibernate Book!")?;
        session.persist(&book)?;
        session.commit()?;

        let before = self.coordinator.statistics().snapshot();
        let result = self.cached_query(POST_GRAPH_QUERY)?;
        let after = self.coordinator.statistics().snapshot();
        check(checks, "posts returned", 1, result.len());
        check(
            checks,
            "query cache misses after insert",
            1,
            after.query_cache_misses - before.query_cache_misses,
        );
        check(
            checks,
            "post 1 still cached",
            true,
            self.coordinator.contains_entity("Post", 1)?,
        );
        Ok(())
    }

    fn flush_keeps_identity(&self, checks: &mut Vec<Check>) -> Result<()> {
        let mut first = self.coordinator.open_session()?;
        first.load("Comment", 2)?;
        first.commit()?;

        let mut session = self.coordinator.open_session()?;
        let comment = session.load("Comment", 2)?;
        let post = session.load("Post", 1)?;
        add_comment(&mut session, &post, "Must read!")?;
        session.flush()?;

        let before = self.coordinator.statistics().snapshot();
        let selects = self.store.stats().selects("Comment");
        let again = session.load("Comment", 2)?;
        let after = self.coordinator.statistics().snapshot();
        check(checks, "same instance after flush", true, again.same_instance(&comment));
        check(
            checks,
            "second-level reads for reload",
            0,
            (after.second_level_hits + after.second_level_misses)
                - (before.second_level_hits + before.second_level_misses),
        );
        check(
            checks,
            "comment selects for reload",
            0,
            self.store.stats().selects("Comment") - selects,
        );
        session.commit()?;

        check(
            checks,
            "comment 2 still cached",
            true,
            self.coordinator.contains_entity("Comment", 2)?,
        );
        Ok(())
    }

    fn cached_query(&self, text: &str) -> Result<Vec<EntityHandle>> {
        let mut session = self.coordinator.open_session()?;
        let result = session
            .create_query(text)
            .set_parameter("id", Value::from_id(1))
            .set_cacheable(true)
            .list()?;
        session.commit()?;
        Ok(result)
    }

    fn report(&self, scenario: Scenario, checks: Vec<Check>) -> ScenarioReport {
        let stats = self.store.stats();
        let store = StoreReport {
            post_selects: stats.selects(TABLES[0]),
            post_details_selects: stats.selects(TABLES[1]),
            comment_selects: stats.selects(TABLES[2]),
            queries: stats.queries(),
            inserts: stats.inserts(),
            updates: stats.updates(),
            deletes: stats.deletes(),
            commits: stats.commits(),
            rows: TABLES.iter().map(|t| self.store.row_count(t)).sum(),
        };
        ScenarioReport {
            scenario,
            description: scenario.description().to_string(),
            checks,
            store,
            cache: self.coordinator.statistics().snapshot().into(),
            regions: self
                .coordinator
                .region_stats()
                .into_iter()
                .map(RegionReport::from)
                .collect(),
        }
    }
}

fn add_comment(session: &mut Session, post: &EntityHandle, review: &str) -> Result<()> {
    let comment = session.instantiate("Comment")?;
    comment.set("review", review)?;
    comment.set_reference("post", Some(post))?;
    session.persist(&comment)?;
    Ok(())
}

fn check<T: PartialEq + std::fmt::Debug>(checks: &mut Vec<Check>, name: &str, expected: T, actual: T) {
    let passed = expected == actual;
    if !passed {
        debug!(check = name, ?expected, ?actual, "check failed");
    }
    checks.push(Check {
        name: name.to_string(),
        expected: format!("{:?}", expected),
        actual: format!("{:?}", actual),
        passed,
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn run(settings: Settings, scenario: Scenario) -> ScenarioReport {
        let dir = TempDir::new().unwrap();
        Runner::new(settings)
            .with_created_on(1_700_000_000_000)
            .run(scenario, dir.path())
            .unwrap()
    }

    fn failed(report: &ScenarioReport) -> Vec<&str> {
        report
            .checks
            .iter()
            .filter(|c| !c.passed)
            .map(|c| c.name.as_str())
            .collect()
    }

    #[test]
    fn test_all_scenarios_pass_with_caching() {
        for scenario in Scenario::ALL {
            let report = run(Settings::default().with_query_cache(true), scenario);
            assert!(report.passed(), "{:?} failed {:?}", scenario, failed(&report));
        }
    }

    #[test]
    fn test_s1_without_second_level_cache() {
        let report = run(Settings::default().with_second_level_cache(false), Scenario::S1);
        assert_eq!(
            failed(&report),
            vec!["post selects after two loads", "second-level hits"]
        );
        assert_eq!(report.store.post_selects, 2);
        assert!(report.regions.is_empty());
    }

    #[test]
    fn test_s3_report_counters() {
        let report = run(Settings::default().with_query_cache(true), Scenario::S3);
        assert_eq!(report.cache.query_cache_misses, 2);
        assert_eq!(report.cache.query_cache_hits, 1);
        assert_eq!(report.store.queries, 2);
        assert_eq!(report.store.inserts, 1);
        assert_eq!(report.store.rows, 5);

        let names: Vec<_> = report.regions.iter().map(|r| r.name.as_str()).collect();
        assert!(names.contains(&"default-query-results-region"));
        assert!(names.contains(&"entity.Post"));
    }

    #[test]
    fn test_existing_store_is_refused() {
        let dir = TempDir::new().unwrap();
        let runner = Runner::new(Settings::default());
        runner.run(Scenario::S1, dir.path()).unwrap();
        assert!(runner.run(Scenario::S1, dir.path()).is_err());
    }

    #[test]
    fn test_report_serializes() {
        let report = run(Settings::default().with_query_cache(true), Scenario::S2);
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["scenario"], "s2");
        assert_eq!(json["checks"].as_array().unwrap().len(), 7);
        assert!(json["regions"].is_array());
    }
}
