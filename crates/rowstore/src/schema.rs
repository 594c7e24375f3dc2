//! Table definitions
//!
//! A table has an id column (implicit), scalar and reference columns, and
//! named relations. A relation is the inverse side of a reference column in
//! another table, e.g. `Post.comments` is backed by `Comment.post`.

use std::collections::HashMap;
use std::sync::Arc;

use ahash::RandomState;

use crate::error::{Error, Result};
use crate::value::ValueKind;

/// Name of the implicit identifier column
pub const ID_COLUMN: &str = "id";

/// How new rows obtain their identifier
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IdGeneration {
    /// Caller supplies the id
    Assigned,
    /// Drawn from the store-wide sequence
    Sequence,
    /// Copied from the row referenced by the named column
    Shared {
        /// Reference column the id is derived from
        column: String,
    },
}

/// Column type
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ColumnKind {
    /// Plain value
    Scalar(ValueKind),
    /// Identifier of a row in another table
    Reference {
        /// Referenced table
        table: String,
    },
}

/// A stored column
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Column {
    /// Column name
    pub name: String,
    /// Column type
    pub kind: ColumnKind,
    /// Whether NULL is accepted
    pub nullable: bool,
}

impl Column {
    /// Nullable scalar column
    pub fn scalar(name: impl Into<String>, kind: ValueKind) -> Self {
        Self {
            name: name.into(),
            kind: ColumnKind::Scalar(kind),
            nullable: true,
        }
    }

    /// Nullable text column
    pub fn text(name: impl Into<String>) -> Self {
        Self::scalar(name, ValueKind::Text)
    }

    /// Nullable timestamp column
    pub fn timestamp(name: impl Into<String>) -> Self {
        Self::scalar(name, ValueKind::Timestamp)
    }

    /// Nullable reference column
    pub fn reference(name: impl Into<String>, table: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: ColumnKind::Reference {
                table: table.into(),
            },
            nullable: true,
        }
    }

    /// Reject NULL
    pub fn not_null(mut self) -> Self {
        self.nullable = false;
        self
    }

    /// Referenced table, if this is a reference column
    pub fn target(&self) -> Option<&str> {
        match &self.kind {
            ColumnKind::Reference { table } => Some(table),
            ColumnKind::Scalar(_) => None,
        }
    }
}

/// Relation cardinality
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cardinality {
    /// At most one row
    One,
    /// Any number of rows
    Many,
}

/// Inverse side of a reference column
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Relation {
    /// Relation name on the owning table
    pub name: String,
    /// Table holding the reference column
    pub table: String,
    /// Reference column in `table`
    pub column: String,
    /// Expected cardinality
    pub cardinality: Cardinality,
}

impl Relation {
    /// Single-valued inverse relation
    pub fn one(name: impl Into<String>, table: impl Into<String>, column: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            table: table.into(),
            column: column.into(),
            cardinality: Cardinality::One,
        }
    }

    /// Collection-valued inverse relation
    pub fn many(name: impl Into<String>, table: impl Into<String>, column: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            table: table.into(),
            column: column.into(),
            cardinality: Cardinality::Many,
        }
    }
}

/// Definition of one table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableSchema {
    name: String,
    id_generation: IdGeneration,
    columns: Vec<Column>,
    relations: Vec<Relation>,
}

impl TableSchema {
    /// New table with assigned identifiers and no columns
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            id_generation: IdGeneration::Assigned,
            columns: Vec::new(),
            relations: Vec::new(),
        }
    }

    /// Set the identifier strategy
    pub fn id_generation(mut self, id_generation: IdGeneration) -> Self {
        self.id_generation = id_generation;
        self
    }

    /// Append a column
    pub fn column(mut self, column: Column) -> Self {
        self.columns.push(column);
        self
    }

    /// Append a relation
    pub fn relation(mut self, relation: Relation) -> Self {
        self.relations.push(relation);
        self
    }

    /// Table name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Identifier strategy
    pub fn id_strategy(&self) -> &IdGeneration {
        &self.id_generation
    }

    /// Columns in storage order (the id column is not included)
    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    /// Relations in declaration order
    pub fn relations(&self) -> &[Relation] {
        &self.relations
    }

    /// Position of a column
    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.name == name)
    }

    /// Position of a relation
    pub fn relation_index(&self, name: &str) -> Option<usize> {
        self.relations.iter().position(|r| r.name == name)
    }
}

/// The set of tables known to a store
#[derive(Debug, Clone)]
pub struct Schema {
    tables: Vec<Arc<TableSchema>>,
    by_name: HashMap<String, usize, RandomState>,
}

impl Schema {
    /// Build and validate a schema
    pub fn new(tables: Vec<TableSchema>) -> Result<Self> {
        let mut by_name = HashMap::with_hasher(RandomState::new());
        for (idx, table) in tables.iter().enumerate() {
            if by_name.insert(table.name.clone(), idx).is_some() {
                return Err(Error::Schema(format!("duplicate table {}", table.name)));
            }
        }

        let schema = Self {
            tables: tables.into_iter().map(Arc::new).collect(),
            by_name,
        };
        schema.validate()?;
        Ok(schema)
    }

    fn validate(&self) -> Result<()> {
        for table in &self.tables {
            for column in &table.columns {
                if column.name == ID_COLUMN {
                    return Err(Error::Schema(format!("{}: `id` is implicit", table.name)));
                }
                if let Some(target) = column.target() {
                    if self.table(target).is_none() {
                        return Err(Error::Schema(format!(
                            "{}.{} references unknown table {}",
                            table.name, column.name, target
                        )));
                    }
                }
            }

            if let IdGeneration::Shared { column } = &table.id_generation {
                let shared = table.column_index(column).map(|idx| &table.columns[idx]);
                match shared {
                    Some(c) if c.target().is_some() && !c.nullable => {}
                    _ => {
                        return Err(Error::Schema(format!(
                            "{}: shared id needs a non-null reference column `{}`",
                            table.name, column
                        )))
                    }
                }
            }

            for relation in &table.relations {
                let other = self.table(&relation.table).ok_or_else(|| {
                    Error::Schema(format!(
                        "{}.{} targets unknown table {}",
                        table.name, relation.name, relation.table
                    ))
                })?;
                let backing = other
                    .column_index(&relation.column)
                    .map(|idx| &other.columns[idx]);
                if backing.and_then(Column::target) != Some(table.name.as_str()) {
                    return Err(Error::Schema(format!(
                        "{}.{} must be backed by a reference from {}.{}",
                        table.name, relation.name, relation.table, relation.column
                    )));
                }
            }
        }
        Ok(())
    }

    /// Look up a table
    pub fn table(&self, name: &str) -> Option<&Arc<TableSchema>> {
        self.by_name.get(name).map(|&idx| &self.tables[idx])
    }

    /// Look up a table or fail
    pub fn require(&self, name: &str) -> Result<&Arc<TableSchema>> {
        self.table(name)
            .ok_or_else(|| Error::Schema(format!("unknown table {}", name)))
    }

    /// All tables in declaration order
    pub fn tables(&self) -> impl Iterator<Item = &Arc<TableSchema>> {
        self.tables.iter()
    }

    /// Every (table, column index) that references `target`
    pub fn references_to<'a>(
        &'a self,
        target: &'a str,
    ) -> impl Iterator<Item = (&'a Arc<TableSchema>, usize)> + 'a {
        self.tables.iter().flat_map(move |table| {
            table
                .columns
                .iter()
                .enumerate()
                .filter(move |(_, c)| c.target() == Some(target))
                .map(move |(idx, _)| (table, idx))
        })
    }
}
