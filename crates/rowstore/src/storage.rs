//! Storage engine implementation
//!
//! File layout:
//! - `db.toon`: Data file with TOON header + journal records
//! - `db.toon.idx`: Index file mapping record numbers to offsets
//!
//! Tables are held in memory. The journal is replayed through a memory map
//! when an existing database is opened.

use std::collections::{BTreeMap, HashMap};
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use ahash::RandomState;
use memmap2::Mmap;
use parking_lot::RwLock;
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::parser::{
    create_header, decode_record, encode_record, parse_header, parse_line, Record, TOON_IDX_MAGIC,
    TOON_MAGIC,
};
use crate::schema::{IdGeneration, Schema, ID_COLUMN};
use crate::stats::StoreStats;
use crate::transaction::{check, Op, Overlay, Transaction, View};
use crate::value::{Id, Value};

/// Maximum journal record size (1 MB)
const MAX_VALUE_SIZE: usize = 1024 * 1024;

/// Maximum database size (1 GB)
const MAX_DB_SIZE: u64 = 1024 * 1024 * 1024;

pub(crate) type Table = BTreeMap<Id, Vec<Value>>;
pub(crate) type Tables = HashMap<String, Table, RandomState>;

/// RowStore is the main database handle
///
/// Cloning the handle shares the underlying database.
#[derive(Clone)]
pub struct RowStore {
    inner: Arc<StoreInner>,
}

pub(crate) struct StoreInner {
    /// Path to the database directory
    path: PathBuf,

    pub(crate) schema: Schema,

    /// Data file handle
    data_file: RwLock<File>,

    /// Index file handle
    idx_file: RwLock<File>,

    /// In-memory index: record number -> offset in data file
    index: RwLock<Vec<u64>>,

    /// Current database size
    db_size: RwLock<u64>,

    /// Is the database closed?
    closed: RwLock<bool>,

    /// Committed rows
    pub(crate) tables: RwLock<Tables>,

    /// Next value of the shared id sequence
    sequence: AtomicU64,

    pub(crate) stats: StoreStats,
}

impl RowStore {
    /// Open or create a database at the given path
    ///
    /// # Arguments
    /// * `path` - Directory path for the database files
    /// * `schema` - Tables the database holds
    ///
    /// # Returns
    /// * `Result<RowStore>` - Database handle
    pub fn open<P: AsRef<Path>>(path: P, schema: Schema) -> Result<Self> {
        let path = path.as_ref();
        std::fs::create_dir_all(path)?;

        let data_path = path.join("db.toon");
        let idx_path = path.join("db.toon.idx");

        let mut tables: Tables = schema
            .tables()
            .map(|t| (t.name().to_string(), Table::new()))
            .collect();

        let mut high_water: Id = 0;
        let (data_file, idx_file, index, db_size) = if data_path.exists() {
            let (data_file, idx_file, indexed, db_size) =
                Self::open_existing(&data_path, &idx_path)?;
            let index = Self::replay(&data_file, db_size, &schema, &mut tables, &mut high_water)?;
            if index.len() != indexed {
                info!(
                    "Rebuilt journal index: {} records ({} indexed at last close)",
                    index.len(),
                    indexed
                );
            }
            (data_file, idx_file, index, db_size)
        } else {
            Self::create_new(&data_path, &idx_path)?
        };

        // Deleted rows keep their ids: the journal still holds their upserts
        let next_id = high_water + 1;

        debug!(
            "Opened rowstore at {} ({} journal records, next id {})",
            path.display(),
            index.len(),
            next_id
        );

        Ok(RowStore {
            inner: Arc::new(StoreInner {
                path: path.to_path_buf(),
                schema,
                data_file: RwLock::new(data_file),
                idx_file: RwLock::new(idx_file),
                index: RwLock::new(index),
                db_size: RwLock::new(db_size),
                closed: RwLock::new(false),
                tables: RwLock::new(tables),
                sequence: AtomicU64::new(next_id),
                stats: StoreStats::new(),
            }),
        })
    }

    fn open_existing(data_path: &Path, idx_path: &Path) -> Result<(File, File, usize, u64)> {
        let mut data_file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(data_path)?;

        let mut idx_file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(idx_path)?;

        // Read and validate data file header
        let mut header_buf = vec![0u8; TOON_MAGIC.len() + 8];
        data_file.read_exact(&mut header_buf)?;
        let _header = parse_header(&header_buf)?;

        let mut idx_magic = vec![0u8; TOON_IDX_MAGIC.len()];
        idx_file.read_exact(&mut idx_magic)?;

        if idx_magic != TOON_IDX_MAGIC {
            return Err(Error::Parse("Invalid index file magic".to_string()));
        }

        let mut count_buf = [0u8; 4];
        idx_file.read_exact(&mut count_buf)?;
        let count = u32::from_le_bytes(count_buf);

        let db_size = data_file.seek(SeekFrom::End(0))?;

        Ok((data_file, idx_file, count as usize, db_size))
    }

    fn create_new(data_path: &Path, idx_path: &Path) -> Result<(File, File, Vec<u64>, u64)> {
        let mut data_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(data_path)?;

        let mut idx_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(idx_path)?;

        let header = create_header(1, 0);
        data_file.write_all(&header)?;

        idx_file.write_all(TOON_IDX_MAGIC)?;
        idx_file.write_all(&0u32.to_le_bytes())?; // count = 0

        let db_size = header.len() as u64;

        Ok((data_file, idx_file, Vec::new(), db_size))
    }

    /// Rebuild tables from the journal, returning the record offsets
    ///
    /// `high_water` is raised to the highest id ever written to a sequence
    /// table, including rows deleted later in the journal.
    fn replay(
        file: &File,
        db_size: u64,
        schema: &Schema,
        tables: &mut Tables,
        high_water: &mut Id,
    ) -> Result<Vec<u64>> {
        let header_len = TOON_MAGIC.len() + 8;
        if db_size as usize <= header_len {
            return Ok(Vec::new());
        }

        // SAFETY: the file was opened by this handle and nothing writes to it
        // until `open` returns, so the mapping is not mutated while read.
        let map = unsafe { Mmap::map(file)? };
        let end = (db_size as usize).min(map.len());

        let mut offsets = Vec::new();
        let mut offset = header_len;
        let mut input = &map[header_len..end];
        while !input.is_empty() {
            let (rest, line) = parse_line(input)?;
            offsets.push(offset as u64);
            if let Some(id) = Self::apply_record(schema, tables, decode_record(line)?)? {
                *high_water = (*high_water).max(id);
            }
            offset += line.len() + 1;
            input = rest;
        }

        Ok(offsets)
    }

    /// Apply one journal record; returns the id of an upsert into a sequence table
    fn apply_record(schema: &Schema, tables: &mut Tables, record: Record) -> Result<Option<Id>> {
        match record {
            Record::Upsert {
                table,
                columns,
                id,
                values,
            } => {
                let def = schema.require(&table)?;
                let expected = std::iter::once(ID_COLUMN)
                    .chain(def.columns().iter().map(|c| c.name.as_str()));
                if !columns.iter().map(String::as_str).eq(expected) {
                    return Err(Error::Parse(format!(
                        "journal columns for {} do not match the schema",
                        table
                    )));
                }
                let sequenced = *def.id_strategy() == IdGeneration::Sequence;
                tables.entry(table).or_default().insert(id, values);
                Ok(sequenced.then_some(id))
            }
            Record::Delete { table, id } => {
                schema.require(&table)?;
                if let Some(rows) = tables.get_mut(&table) {
                    rows.remove(&id);
                }
                Ok(None)
            }
        }
    }

    /// Start a transaction
    pub fn begin(&self) -> Result<Transaction> {
        self.inner.ensure_open()?;
        Ok(Transaction::new(Arc::clone(&self.inner)))
    }

    /// Tables held by this database
    pub fn schema(&self) -> &Schema {
        &self.inner.schema
    }

    /// Statement counters
    pub fn stats(&self) -> &StoreStats {
        &self.inner.stats
    }

    /// Directory holding the database files
    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    /// Number of committed rows in a table
    pub fn row_count(&self, table: &str) -> usize {
        self.inner.tables.read().get(table).map_or(0, |rows| rows.len())
    }

    /// Get the number of journal records
    pub fn len(&self) -> usize {
        self.inner.index.read().len()
    }

    /// Check if the journal is empty
    pub fn is_empty(&self) -> bool {
        self.inner.index.read().is_empty()
    }

    /// Close the database and fsync all changes
    pub fn close(&self) -> Result<()> {
        self.inner.close()
    }
}

impl StoreInner {
    pub(crate) fn ensure_open(&self) -> Result<()> {
        if *self.closed.read() {
            return Err(Error::Closed);
        }
        Ok(())
    }

    pub(crate) fn next_id(&self) -> Id {
        self.sequence.fetch_add(1, Ordering::SeqCst)
    }

    /// Validate and apply a batch of writes atomically
    pub(crate) fn commit(&self, ops: Vec<Op>) -> Result<()> {
        self.ensure_open()?;

        let mut tables = self.tables.write();
        let mut applied = Overlay::default();
        for op in &ops {
            check(&self.schema, &View::new(&tables, &applied), op)?;
            applied.apply(op);
        }

        self.append(&applied.records(&self.schema))?;
        applied.merge_into(&mut tables);

        for op in &ops {
            match op {
                Op::Insert { .. } => self.stats.record_insert(),
                Op::Update { .. } => self.stats.record_update(),
                Op::Delete { .. } => self.stats.record_delete(),
            }
        }
        self.stats.record_commit();
        debug!("Committed {} writes", ops.len());

        Ok(())
    }

    /// Append journal records as one write
    fn append(&self, records: &[Record]) -> Result<()> {
        if records.is_empty() {
            return Ok(());
        }

        let mut buf = Vec::new();
        let mut starts = Vec::with_capacity(records.len());
        for record in records {
            let line = encode_record(record);
            if line.len() > MAX_VALUE_SIZE {
                return Err(Error::ValueTooLarge(line.len()));
            }
            starts.push(buf.len() as u64);
            buf.extend_from_slice(&line);
            buf.push(b'\n');
        }

        let mut db_size = self.db_size.write();
        if *db_size + buf.len() as u64 > MAX_DB_SIZE {
            return Err(Error::DatabaseFull(*db_size));
        }

        let mut data_file = self.data_file.write();
        let mut index = self.index.write();

        let offset = data_file.seek(SeekFrom::End(0))?;
        data_file.write_all(&buf)?;

        index.extend(starts.iter().map(|start| offset + start));
        *db_size = offset + buf.len() as u64;

        Ok(())
    }

    fn close(&self) -> Result<()> {
        if *self.closed.read() {
            return Ok(());
        }

        // Update data file header with current record count
        let index = self.index.read();
        let row_count = index.len() as u32;

        let mut data_file = self.data_file.write();
        data_file.seek(SeekFrom::Start(TOON_MAGIC.len() as u64 + 4))?;
        data_file.write_all(&row_count.to_le_bytes())?;
        data_file.sync_all()?;

        let mut idx_file = self.idx_file.write();
        idx_file.seek(SeekFrom::Start(TOON_IDX_MAGIC.len() as u64))?;
        idx_file.write_all(&row_count.to_le_bytes())?;

        for offset in index.iter() {
            idx_file.write_all(&offset.to_le_bytes())?;
        }
        idx_file.sync_all()?;

        *self.closed.write() = true;

        Ok(())
    }
}

impl Drop for StoreInner {
    fn drop(&mut self) {
        let _ = self.close();
    }
}
