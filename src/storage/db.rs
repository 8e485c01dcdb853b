use redb::{Database as RedbDatabase, ReadTransaction, ReadableTable, Table, WriteTransaction};
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;

use super::tables::*;

#[derive(Debug, Error)]
pub enum DatabaseError {
    #[error("Commit error: {0}")]
    Commit(Box<redb::CommitError>),
    #[error("Database error: {0}")]
    Redb(Box<redb::Error>),
    #[error("Database error: {0}")]
    RedbDatabase(Box<redb::DatabaseError>),
    #[error("Deserialization error: {0}")]
    Deserialization(#[from] rmp_serde::decode::Error),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Serialization error: {0}")]
    Serialization(#[from] rmp_serde::encode::Error),
    #[error("Storage error: {0}")]
    Storage(Box<redb::StorageError>),
    #[error("Table error: {0}")]
    Table(Box<redb::TableError>),
    #[error("Transaction error: {0}")]
    Transaction(Box<redb::TransactionError>),
}

impl From<redb::CommitError> for DatabaseError {
    fn from(e: redb::CommitError) -> Self {
        DatabaseError::Commit(Box::new(e))
    }
}

impl From<redb::DatabaseError> for DatabaseError {
    fn from(e: redb::DatabaseError) -> Self {
        DatabaseError::RedbDatabase(Box::new(e))
    }
}

impl From<redb::Error> for DatabaseError {
    fn from(e: redb::Error) -> Self {
        DatabaseError::Redb(Box::new(e))
    }
}

impl From<redb::StorageError> for DatabaseError {
    fn from(e: redb::StorageError) -> Self {
        DatabaseError::Storage(Box::new(e))
    }
}

impl From<redb::TableError> for DatabaseError {
    fn from(e: redb::TableError) -> Self {
        DatabaseError::Table(Box::new(e))
    }
}

impl From<redb::TransactionError> for DatabaseError {
    fn from(e: redb::TransactionError) -> Self {
        DatabaseError::Transaction(Box::new(e))
    }
}

/// redb-backed metadata store for file records, owner/fingerprint indexes
/// and plan assignments.
#[derive(Clone)]
pub struct Database {
    db: Arc<RedbDatabase>,
}

impl Database {
    /// Open or create a database at the given path
    pub fn open<P: AsRef<Path>>(data_dir: P) -> Result<Self, DatabaseError> {
        std::fs::create_dir_all(data_dir.as_ref())?;
        let db_path = data_dir.as_ref().join("storage-orchestrator.redb");
        let db = Arc::new(RedbDatabase::create(db_path)?);

        let write_txn = db.begin_write()?;
        {
            let _ = write_txn.open_table(FILES)?;
            let _ = write_txn.open_table(OWNER_FILES)?;
            let _ = write_txn.open_table(OWNER_FINGERPRINTS)?;
            let _ = write_txn.open_table(OWNER_PLANS)?;
        }
        write_txn.commit()?;

        Ok(Self { db })
    }

    pub fn begin_read(&self) -> Result<ReadTransaction, DatabaseError> {
        Ok(self.db.begin_read()?)
    }

    pub fn begin_write(&self) -> Result<WriteTransaction, DatabaseError> {
        Ok(self.db.begin_write()?)
    }

    // ========================================================================
    // Plan assignments
    // ========================================================================

    pub fn assign_plan(&self, owner_id: &str, plan: &str) -> Result<(), DatabaseError> {
        let write_txn = self.begin_write()?;
        {
            let mut table = write_txn.open_table(OWNER_PLANS)?;
            table.insert(owner_id, plan)?;
        }
        write_txn.commit()?;
        Ok(())
    }

    pub fn assigned_plan(&self, owner_id: &str) -> Result<Option<String>, DatabaseError> {
        let read_txn = self.begin_read()?;
        let table = read_txn.open_table(OWNER_PLANS)?;
        Ok(table.get(owner_id)?.map(|v| v.value().to_string()))
    }
}

// ============================================================================
// Index helpers (key -> msgpack Vec<String> of file ids)
// ============================================================================

pub(super) fn read_index<T>(table: &T, key: &str) -> Result<Vec<String>, DatabaseError>
where
    T: ReadableTable<&'static str, &'static [u8]>,
{
    match table.get(key)? {
        Some(data) => Ok(rmp_serde::from_slice(data.value())?),
        None => Ok(Vec::new()),
    }
}

pub(super) fn index_insert(
    table: &mut Table<'_, &'static str, &'static [u8]>,
    key: &str,
    file_id: &str,
) -> Result<(), DatabaseError> {
    let mut ids = read_index(table, key)?;
    if !ids.iter().any(|id| id == file_id) {
        ids.push(file_id.to_string());
        let data = rmp_serde::to_vec_named(&ids)?;
        table.insert(key, data.as_slice())?;
    }
    Ok(())
}

pub(super) fn index_remove(
    table: &mut Table<'_, &'static str, &'static [u8]>,
    key: &str,
    file_id: &str,
) -> Result<(), DatabaseError> {
    let mut ids = read_index(table, key)?;
    let before = ids.len();
    ids.retain(|id| id != file_id);
    if ids.len() == before {
        return Ok(());
    }
    if ids.is_empty() {
        table.remove(key)?;
    } else {
        let data = rmp_serde::to_vec_named(&ids)?;
        table.insert(key, data.as_slice())?;
    }
    Ok(())
}
