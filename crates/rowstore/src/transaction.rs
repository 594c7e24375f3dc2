//! Transactions
//!
//! Writes are staged in an overlay and validated twice: when staged, against
//! the committed rows plus earlier staged writes, and again under the table
//! write lock at commit. Reads through the transaction see its own writes.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use ahash::RandomState;
use tracing::debug;

use crate::error::{Conflict, Error, Result};
use crate::parser::Record;
use crate::query::{FilterColumn, Operand, Plan, Query, Via};
use crate::schema::{ColumnKind, IdGeneration, Schema, TableSchema, ID_COLUMN};
use crate::storage::{StoreInner, Tables};
use crate::value::{Id, Value};

/// A row as stored: identifier plus column values in schema order
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Row {
    /// Row identifier
    pub id: Id,
    /// Column values, id excluded
    pub values: Vec<Value>,
}

/// A row reached through a `join fetch`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchedRow {
    /// Table the row belongs to
    pub table: String,
    /// The row
    pub row: Row,
}

/// Result of a query
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueryOutput {
    /// Selected table
    pub table: String,
    /// Selected rows, ordered by id
    pub roots: Vec<Row>,
    /// Rows loaded by join fetches
    pub fetched: Vec<FetchedRow>,
}

/// A staged write
#[derive(Debug, Clone)]
pub(crate) enum Op {
    Insert {
        table: String,
        id: Id,
        values: Vec<Value>,
    },
    Update {
        table: String,
        id: Id,
        values: Vec<Value>,
    },
    Delete {
        table: String,
        id: Id,
    },
}

impl Op {
    fn table(&self) -> &str {
        match self {
            Op::Insert { table, .. } | Op::Update { table, .. } | Op::Delete { table, .. } => table,
        }
    }

    fn id(&self) -> Id {
        match self {
            Op::Insert { id, .. } | Op::Update { id, .. } | Op::Delete { id, .. } => *id,
        }
    }

    fn image(&self) -> Option<&Vec<Value>> {
        match self {
            Op::Insert { values, .. } | Op::Update { values, .. } => Some(values),
            Op::Delete { .. } => None,
        }
    }
}

/// Latest image per touched row; `None` marks a deletion
#[derive(Default)]
pub(crate) struct Overlay {
    tables: HashMap<String, BTreeMap<Id, Option<Vec<Value>>>, RandomState>,
}

impl Overlay {
    pub(crate) fn apply(&mut self, op: &Op) {
        self.tables
            .entry(op.table().to_string())
            .or_default()
            .insert(op.id(), op.image().cloned());
    }

    pub(crate) fn records(&self, schema: &Schema) -> Vec<Record> {
        let mut records = Vec::new();
        for (table, rows) in &self.tables {
            let columns: Vec<String> = std::iter::once(ID_COLUMN.to_string())
                .chain(
                    schema
                        .table(table)
                        .into_iter()
                        .flat_map(|t| t.columns().iter().map(|c| c.name.clone())),
                )
                .collect();
            for (id, image) in rows {
                records.push(match image {
                    Some(values) => Record::Upsert {
                        table: table.clone(),
                        columns: columns.clone(),
                        id: *id,
                        values: values.clone(),
                    },
                    None => Record::Delete {
                        table: table.clone(),
                        id: *id,
                    },
                });
            }
        }
        records
    }

    pub(crate) fn merge_into(self, tables: &mut Tables) {
        for (table, rows) in self.tables {
            let target = tables.entry(table).or_default();
            for (id, image) in rows {
                match image {
                    Some(values) => {
                        target.insert(id, values);
                    }
                    None => {
                        target.remove(&id);
                    }
                }
            }
        }
    }

    fn is_empty(&self) -> bool {
        self.tables.values().all(BTreeMap::is_empty)
    }
}

/// Committed rows seen through an overlay
pub(crate) struct View<'a> {
    base: &'a Tables,
    overlay: &'a Overlay,
}

impl<'a> View<'a> {
    pub(crate) fn new(base: &'a Tables, overlay: &'a Overlay) -> Self {
        Self { base, overlay }
    }

    fn row(&self, table: &str, id: Id) -> Option<&'a [Value]> {
        let overlay: &'a Overlay = self.overlay;
        if let Some(image) = overlay.tables.get(table).and_then(|rows| rows.get(&id)) {
            return image.as_deref();
        }
        let base: &'a Tables = self.base;
        base.get(table).and_then(|rows| rows.get(&id)).map(Vec::as_slice)
    }

    fn rows(&self, table: &str) -> Vec<(Id, &'a [Value])> {
        let overlay: &'a Overlay = self.overlay;
        let base: &'a Tables = self.base;
        let staged = overlay.tables.get(table);

        let mut out: BTreeMap<Id, &'a [Value]> = BTreeMap::new();
        if let Some(rows) = base.get(table) {
            for (id, values) in rows {
                if staged.map_or(true, |s| !s.contains_key(id)) {
                    out.insert(*id, values.as_slice());
                }
            }
        }
        if let Some(staged) = staged {
            for (id, image) in staged {
                if let Some(values) = image {
                    out.insert(*id, values.as_slice());
                }
            }
        }
        out.into_iter().collect()
    }
}

/// Check a write against the rows visible in `view`
pub(crate) fn check(schema: &Schema, view: &View<'_>, op: &Op) -> Result<()> {
    let table = schema.require(op.table())?;
    let id = op.id();
    let exists = view.row(table.name(), id).is_some();

    match op {
        Op::Insert { values, .. } => {
            if exists {
                return Err(Conflict::DuplicateId {
                    table: table.name().to_string(),
                    id,
                }
                .into());
            }
            check_values(table, view, id, values)
        }
        Op::Update { values, .. } => {
            if !exists {
                return Err(Conflict::MissingRow {
                    table: table.name().to_string(),
                    id,
                }
                .into());
            }
            check_values(table, view, id, values)
        }
        Op::Delete { .. } => {
            if !exists {
                return Err(Conflict::MissingRow {
                    table: table.name().to_string(),
                    id,
                }
                .into());
            }
            for (referrer, column) in schema.references_to(table.name()) {
                let referenced = view.rows(referrer.name()).iter().any(|(rid, values)| {
                    values[column].as_id() == Some(id)
                        && !(referrer.name() == table.name() && *rid == id)
                });
                if referenced {
                    return Err(Conflict::StillReferenced {
                        table: table.name().to_string(),
                        id,
                        by: referrer.name().to_string(),
                    }
                    .into());
                }
            }
            Ok(())
        }
    }
}

fn check_values(table: &TableSchema, view: &View<'_>, id: Id, values: &[Value]) -> Result<()> {
    if values.len() != table.columns().len() {
        return Err(Conflict::Arity {
            table: table.name().to_string(),
            expected: table.columns().len(),
            actual: values.len(),
        }
        .into());
    }

    for (column, value) in table.columns().iter().zip(values) {
        if value.is_null() {
            if !column.nullable {
                return Err(Conflict::NullValue {
                    table: table.name().to_string(),
                    column: column.name.clone(),
                }
                .into());
            }
            continue;
        }

        match &column.kind {
            ColumnKind::Scalar(kind) => {
                if value.kind() != Some(*kind) {
                    return Err(Conflict::TypeMismatch {
                        table: table.name().to_string(),
                        column: column.name.clone(),
                        expected: *kind,
                    }
                    .into());
                }
            }
            ColumnKind::Reference { table: target } => {
                let target_id = value.as_id().ok_or_else(|| Conflict::TypeMismatch {
                    table: table.name().to_string(),
                    column: column.name.clone(),
                    expected: crate::value::ValueKind::Int,
                })?;
                let self_reference = target == table.name() && target_id == id;
                if !self_reference && view.row(target, target_id).is_none() {
                    return Err(Conflict::DanglingReference {
                        table: table.name().to_string(),
                        column: column.name.clone(),
                        target: target_id,
                    }
                    .into());
                }
            }
        }
    }

    if let IdGeneration::Shared { column } = table.id_strategy() {
        let shared = table
            .column_index(column)
            .and_then(|idx| values[idx].as_id())
            .unwrap_or_default();
        if shared != id {
            return Err(Conflict::SharedId {
                table: table.name().to_string(),
                id,
                expected: shared,
            }
            .into());
        }
    }

    Ok(())
}

fn bind(operand: &Operand, params: &[(String, Value)]) -> Result<Value> {
    match operand {
        Operand::Literal(value) => Ok(value.clone()),
        Operand::Parameter(name) => params
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.clone())
            .ok_or_else(|| Error::Query(format!("parameter :{} is not bound", name))),
    }
}

/// A unit of work against the store
///
/// Dropping an unfinished transaction rolls it back.
pub struct Transaction {
    store: Arc<StoreInner>,
    ops: Vec<Op>,
    overlay: Overlay,
    finished: bool,
}

impl Transaction {
    pub(crate) fn new(store: Arc<StoreInner>) -> Self {
        Self {
            store,
            ops: Vec::new(),
            overlay: Overlay::default(),
            finished: false,
        }
    }

    /// Tables of the underlying store
    pub fn schema(&self) -> &Schema {
        &self.store.schema
    }

    /// Whether writes are staged
    pub fn is_dirty(&self) -> bool {
        !self.overlay.is_empty()
    }

    /// Draw the next value of the shared id sequence
    pub fn next_id(&self) -> Id {
        self.store.next_id()
    }

    /// Fetch one row by id
    pub fn get(&self, table: &str, id: Id) -> Result<Option<Row>> {
        self.store.ensure_open()?;
        let schema = self.store.schema.require(table)?;
        self.store.stats.record_select(schema.name());

        let tables = self.store.tables.read();
        let view = View::new(&tables, &self.overlay);
        Ok(view.row(table, id).map(|values| Row {
            id,
            values: values.to_vec(),
        }))
    }

    /// Ids of the rows on the inverse side of a relation
    pub fn related(&self, table: &str, id: Id, relation: &str) -> Result<Vec<Id>> {
        self.store.ensure_open()?;
        let schema = self.store.schema.require(table)?;
        let relation = schema
            .relation_index(relation)
            .map(|idx| &schema.relations()[idx])
            .ok_or_else(|| Error::Schema(format!("{} has no relation `{}`", table, relation)))?;
        let column = self
            .store
            .schema
            .require(&relation.table)?
            .column_index(&relation.column)
            .ok_or_else(|| Error::Schema(format!("missing column {}", relation.column)))?;
        self.store.stats.record_select(&relation.table);

        let tables = self.store.tables.read();
        let view = View::new(&tables, &self.overlay);
        Ok(view
            .rows(&relation.table)
            .into_iter()
            .filter(|(_, values)| values[column].as_id() == Some(id))
            .map(|(child, _)| child)
            .collect())
    }

    /// Parse, plan and run a query
    pub fn query(&self, text: &str, params: &[(String, Value)]) -> Result<QueryOutput> {
        let plan = Query::parse(text)?.plan(&self.store.schema)?;
        self.select(&plan, params)
    }

    /// Run a planned query
    pub fn select(&self, plan: &Plan, params: &[(String, Value)]) -> Result<QueryOutput> {
        self.store.ensure_open()?;
        let bound = plan
            .filters
            .iter()
            .map(|f| Ok((f.column, bind(&f.operand, params)?)))
            .collect::<Result<Vec<_>>>()?;

        self.store.stats.record_query();
        self.store.stats.record_select(plan.root.name());

        let tables = self.store.tables.read();
        let view = View::new(&tables, &self.overlay);
        let root = plan.root.name();

        let by_id = bound.iter().find(|(column, _)| *column == FilterColumn::Id);
        let candidates: Vec<(Id, &[Value])> = match by_id {
            Some((_, value)) => value
                .as_id()
                .and_then(|id| view.row(root, id).map(|values| (id, values)))
                .into_iter()
                .collect(),
            None => view.rows(root),
        };

        let roots: Vec<Row> = candidates
            .into_iter()
            .filter(|(id, values)| {
                bound.iter().all(|(column, value)| match column {
                    FilterColumn::Id => Value::from_id(*id) == *value,
                    FilterColumn::Column(idx) => values[*idx] == *value,
                })
            })
            .map(|(id, values)| Row {
                id,
                values: values.to_vec(),
            })
            .collect();

        let mut sources: Vec<Vec<Id>> = vec![roots.iter().map(|row| row.id).collect()];
        let mut fetched = Vec::new();
        for fetch in &plan.fetches {
            let source_table = if fetch.source == 0 {
                &plan.root
            } else {
                &plan.fetches[fetch.source - 1].table
            };
            let parents = &sources[fetch.source];

            let mut ids = BTreeSet::new();
            match fetch.via {
                Via::Relation(idx) => {
                    let relation = &source_table.relations()[idx];
                    let column = fetch
                        .table
                        .column_index(&relation.column)
                        .ok_or_else(|| Error::Schema(format!("missing column {}", relation.column)))?;
                    let parents: HashSet<Id> = parents.iter().copied().collect();
                    for (id, values) in view.rows(fetch.table.name()) {
                        if values[column].as_id().map_or(false, |p| parents.contains(&p)) {
                            ids.insert(id);
                        }
                    }
                }
                Via::Reference(idx) => {
                    for parent in parents {
                        if let Some(target) = view
                            .row(source_table.name(), *parent)
                            .and_then(|values| values[idx].as_id())
                        {
                            ids.insert(target);
                        }
                    }
                }
            }

            for id in &ids {
                if let Some(values) = view.row(fetch.table.name(), *id) {
                    fetched.push(FetchedRow {
                        table: fetch.table.name().to_string(),
                        row: Row {
                            id: *id,
                            values: values.to_vec(),
                        },
                    });
                }
            }
            sources.push(ids.into_iter().collect());
        }

        Ok(QueryOutput {
            table: root.to_string(),
            roots,
            fetched,
        })
    }

    /// Stage an insert
    pub fn insert(&mut self, table: &str, id: Id, values: Vec<Value>) -> Result<()> {
        self.stage(Op::Insert {
            table: table.to_string(),
            id,
            values,
        })
    }

    /// Stage a full-row update
    pub fn update(&mut self, table: &str, id: Id, values: Vec<Value>) -> Result<()> {
        self.stage(Op::Update {
            table: table.to_string(),
            id,
            values,
        })
    }

    /// Stage a delete
    pub fn delete(&mut self, table: &str, id: Id) -> Result<()> {
        self.stage(Op::Delete {
            table: table.to_string(),
            id,
        })
    }

    fn stage(&mut self, op: Op) -> Result<()> {
        self.store.ensure_open()?;
        {
            let tables = self.store.tables.read();
            check(&self.store.schema, &View::new(&tables, &self.overlay), &op)?;
        }
        self.overlay.apply(&op);
        self.ops.push(op);
        Ok(())
    }

    /// Apply every staged write atomically
    pub fn commit(mut self) -> Result<()> {
        self.finished = true;
        let ops = std::mem::take(&mut self.ops);
        if ops.is_empty() {
            self.store.stats.record_commit();
            return Ok(());
        }
        match self.store.commit(ops) {
            Ok(()) => Ok(()),
            Err(e) => {
                self.store.stats.record_rollback();
                Err(e)
            }
        }
    }

    /// Discard every staged write
    pub fn rollback(mut self) {
        self.finished = true;
        self.abandon();
        self.store.stats.record_rollback();
    }

    fn abandon(&mut self) {
        if !self.ops.is_empty() {
            debug!("Discarding {} staged writes", self.ops.len());
        }
        self.ops.clear();
        self.overlay = Overlay::default();
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if !self.finished && !self.ops.is_empty() {
            self.abandon();
            self.store.stats.record_rollback();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{Column, Relation};
    use crate::storage::RowStore;
    use tempfile::TempDir;

    fn open(dir: &TempDir) -> RowStore {
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
        ])
        .unwrap();
        RowStore::open(dir.path(), schema).unwrap()
    }

    fn seed(db: &RowStore) {
        let mut tx = db.begin().unwrap();
        tx.insert("Post", 1, vec!["Hibernate Master Class".into()]).unwrap();
        tx.insert("PostDetails", 1, vec![Value::Timestamp(0), Value::Int(1)])
            .unwrap();
        tx.insert("Comment", 2, vec!["Good post!".into(), Value::Int(1)])
            .unwrap();
        tx.insert("Comment", 3, vec!["Nice post!".into(), Value::Int(1)])
            .unwrap();
        tx.commit().unwrap();
    }

    #[test]
    fn test_read_your_writes() {
        let dir = TempDir::new().unwrap();
        let db = open(&dir);

        let mut tx = db.begin().unwrap();
        tx.insert("Post", 1, vec!["draft".into()]).unwrap();
        assert!(tx.get("Post", 1).unwrap().is_some());

        // Other transactions do not see staged rows
        let other = db.begin().unwrap();
        assert!(other.get("Post", 1).unwrap().is_none());

        tx.rollback();
        assert_eq!(db.row_count("Post"), 0);
        assert_eq!(db.stats().rollbacks(), 1);
    }

    #[test]
    fn test_related_ids() {
        let dir = TempDir::new().unwrap();
        let db = open(&dir);
        seed(&db);

        let tx = db.begin().unwrap();
        assert_eq!(tx.related("Post", 1, "comments").unwrap(), vec![2, 3]);
        assert_eq!(tx.related("Post", 1, "details").unwrap(), vec![1]);
        assert!(matches!(
            tx.related("Post", 1, "tags"),
            Err(Error::Schema(_))
        ));
    }

    #[test]
    fn test_join_fetch_query() {
        let dir = TempDir::new().unwrap();
        let db = open(&dir);
        seed(&db);

        let tx = db.begin().unwrap();
        let output = tx
            .query(
                "select p from Post p join fetch p.details join fetch p.comments where p.id = :id",
                &[("id".to_string(), Value::Int(1))],
            )
            .unwrap();

        assert_eq!(output.roots.len(), 1);
        assert_eq!(output.roots[0].id, 1);
        let tables: Vec<_> = output
            .fetched
            .iter()
            .map(|f| (f.table.as_str(), f.row.id))
            .collect();
        assert_eq!(tables, vec![("PostDetails", 1), ("Comment", 2), ("Comment", 3)]);
        assert_eq!(db.stats().queries(), 1);
        assert_eq!(db.stats().selects("Post"), 1);
    }

    #[test]
    fn test_query_by_column_and_reference_fetch() {
        let dir = TempDir::new().unwrap();
        let db = open(&dir);
        seed(&db);

        let tx = db.begin().unwrap();
        let output = tx
            .query(
                "select c from Comment c join fetch c.post where c.review = :review",
                &[("review".to_string(), "Nice post!".into())],
            )
            .unwrap();
        assert_eq!(output.roots.iter().map(|r| r.id).collect::<Vec<_>>(), vec![3]);
        assert_eq!(output.fetched.len(), 1);
        assert_eq!(output.fetched[0].table, "Post");
    }

    #[test]
    fn test_unbound_parameter() {
        let dir = TempDir::new().unwrap();
        let db = open(&dir);

        let tx = db.begin().unwrap();
        let result = tx.query("select p from Post p where p.id = :id", &[]);
        assert!(matches!(result, Err(Error::Query(_))));
    }

    #[test]
    fn test_constraint_conflicts() {
        let dir = TempDir::new().unwrap();
        let db = open(&dir);
        seed(&db);

        let mut tx = db.begin().unwrap();
        assert!(matches!(
            tx.insert("Post", 1, vec!["again".into()]),
            Err(Error::Conflict(Conflict::DuplicateId { .. }))
        ));
        assert!(matches!(
            tx.update("Post", 99, vec!["ghost".into()]),
            Err(Error::Conflict(Conflict::MissingRow { .. }))
        ));
        assert!(matches!(
            tx.insert("Comment", 9, vec!["orphan".into(), Value::Int(42)]),
            Err(Error::Conflict(Conflict::DanglingReference { .. }))
        ));
        assert!(matches!(
            tx.insert("Comment", 9, vec![Value::Int(5), Value::Null]),
            Err(Error::Conflict(Conflict::TypeMismatch { .. }))
        ));
        assert!(matches!(
            tx.insert("PostDetails", 2, vec![Value::Timestamp(0), Value::Int(1)]),
            Err(Error::Conflict(Conflict::SharedId { .. }))
        ));
        assert!(matches!(
            tx.delete("Post", 1),
            Err(Error::Conflict(Conflict::StillReferenced { .. }))
        ));
        assert!(!tx.is_dirty());
    }

    #[test]
    fn test_children_deleted_first() {
        let dir = TempDir::new().unwrap();
        let db = open(&dir);
        seed(&db);

        let mut tx = db.begin().unwrap();
        tx.delete("Comment", 2).unwrap();
        tx.delete("Comment", 3).unwrap();
        tx.delete("PostDetails", 1).unwrap();
        tx.delete("Post", 1).unwrap();
        tx.commit().unwrap();

        assert_eq!(db.row_count("Post"), 0);
        assert_eq!(db.stats().deletes(), 4);
    }

    #[test]
    fn test_commit_revalidates_against_concurrent_writes() {
        let dir = TempDir::new().unwrap();
        let db = open(&dir);

        let mut first = db.begin().unwrap();
        let mut second = db.begin().unwrap();
        first.insert("Post", 5, vec!["a".into()]).unwrap();
        second.insert("Post", 5, vec!["b".into()]).unwrap();

        first.commit().unwrap();
        assert!(matches!(
            second.commit(),
            Err(Error::Conflict(Conflict::DuplicateId { .. }))
        ));

        let tx = db.begin().unwrap();
        assert_eq!(
            tx.get("Post", 5).unwrap().unwrap().values,
            vec![Value::Text("a".into())]
        );
    }
}
