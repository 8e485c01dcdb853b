use std::collections::BTreeSet;

use redb::ReadableTable;

use super::db::{index_insert, index_remove, read_index, Database, DatabaseError};
use super::models::{FileRecord, Transition};
use super::tables::*;

impl Database {
    // ========================================================================
    // File operations
    // ========================================================================

    /// Store a new file record and update the owner and fingerprint indexes
    pub fn put_file(&self, file: &FileRecord) -> Result<(), DatabaseError> {
        debug_assert!(!file.id.is_empty(), "file id must not be empty");
        debug_assert!(!file.owner_id.is_empty(), "owner id must not be empty");

        let write_txn = self.begin_write()?;
        {
            let mut table = write_txn.open_table(FILES)?;
            let data = rmp_serde::to_vec_named(file)?;
            table.insert(file.id.as_str(), data.as_slice())?;

            let mut owner_table = write_txn.open_table(OWNER_FILES)?;
            index_insert(&mut owner_table, &file.owner_id, &file.id)?;

            if let Some(ref fp) = file.content_fingerprint {
                let mut fp_table = write_txn.open_table(OWNER_FINGERPRINTS)?;
                index_insert(&mut fp_table, &fingerprint_key(&file.owner_id, fp), &file.id)?;
            }
        }
        write_txn.commit()?;
        Ok(())
    }

    /// Get a file by its UUID
    pub fn get_file(&self, id: &str) -> Result<Option<FileRecord>, DatabaseError> {
        let read_txn = self.begin_read()?;
        let table = read_txn.open_table(FILES)?;

        match table.get(id)? {
            Some(data) => Ok(Some(rmp_serde::from_slice(data.value())?)),
            None => Ok(None),
        }
    }

    /// All records (deleted or not) belonging to an owner
    pub fn get_files_by_owner(&self, owner_id: &str) -> Result<Vec<FileRecord>, DatabaseError> {
        let read_txn = self.begin_read()?;
        let owner_table = read_txn.open_table(OWNER_FILES)?;
        let files_table = read_txn.open_table(FILES)?;

        let mut files: Vec<FileRecord> = Vec::new();
        for file_id in read_index(&owner_table, owner_id)? {
            if let Some(data) = files_table.get(file_id.as_str())? {
                files.push(rmp_serde::from_slice(data.value())?);
            }
        }
        files.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(files)
    }

    /// Records of one owner sharing a content fingerprint
    pub fn get_files_by_fingerprint(
        &self,
        owner_id: &str,
        fingerprint: &str,
    ) -> Result<Vec<FileRecord>, DatabaseError> {
        let read_txn = self.begin_read()?;
        let fp_table = read_txn.open_table(OWNER_FINGERPRINTS)?;
        let files_table = read_txn.open_table(FILES)?;

        let mut files = Vec::new();
        for file_id in read_index(&fp_table, &fingerprint_key(owner_id, fingerprint))? {
            if let Some(data) = files_table.get(file_id.as_str())? {
                let file: FileRecord = rmp_serde::from_slice(data.value())?;
                // The index is keyed by owner; double-check anyway.
                if file.owner_id == owner_id {
                    files.push(file);
                }
            }
        }
        files.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(files)
    }

    /// Every owner with at least one record
    pub fn get_owners(&self) -> Result<Vec<String>, DatabaseError> {
        let read_txn = self.begin_read()?;
        let table = read_txn.open_table(OWNER_FILES)?;

        let mut owners = BTreeSet::new();
        for result in table.iter()? {
            let (key, _) = result?;
            owners.insert(key.value().to_string());
        }
        Ok(owners.into_iter().collect())
    }

    /// Remove a record and its index entries. Returns the removed record.
    pub fn delete_file(&self, id: &str) -> Result<Option<FileRecord>, DatabaseError> {
        self.delete_file_if(id, |_| true)
    }

    /// Like [`Database::delete_file`], but only when `keep_going` approves the
    /// record as read inside the delete transaction.
    pub fn delete_file_if<F>(
        &self,
        id: &str,
        keep_going: F,
    ) -> Result<Option<FileRecord>, DatabaseError>
    where
        F: FnOnce(&FileRecord) -> bool,
    {
        let write_txn = self.begin_write()?;

        let existing: Option<FileRecord> = {
            let table = write_txn.open_table(FILES)?;
            let result = match table.get(id)? {
                Some(data) => Some(rmp_serde::from_slice(data.value())?),
                None => None,
            };
            result
        };

        let existing = existing.filter(|file| keep_going(file));
        let Some(ref file) = existing else {
            write_txn.abort()?;
            return Ok(None);
        };

        {
            let mut table = write_txn.open_table(FILES)?;
            table.remove(id)?;
        }
        {
            let mut owner_table = write_txn.open_table(OWNER_FILES)?;
            index_remove(&mut owner_table, &file.owner_id, id)?;
        }
        if let Some(ref fp) = file.content_fingerprint {
            let mut fp_table = write_txn.open_table(OWNER_FINGERPRINTS)?;
            index_remove(&mut fp_table, &fingerprint_key(&file.owner_id, fp), id)?;
        }

        write_txn.commit()?;
        Ok(existing)
    }

    /// Read-modify-write a single record inside one write transaction.
    ///
    /// The closure returns `false` when the record is already in the desired
    /// state; nothing is written in that case. `updated_at` is bumped and the
    /// fingerprint index is kept in sync on every applied change.
    pub fn mutate_file<F>(&self, id: &str, f: F) -> Result<Transition<FileRecord>, DatabaseError>
    where
        F: FnOnce(&mut FileRecord) -> bool,
    {
        let write_txn = self.begin_write()?;

        let existing: Option<FileRecord> = {
            let table = write_txn.open_table(FILES)?;
            let result = match table.get(id)? {
                Some(data) => Some(rmp_serde::from_slice(data.value())?),
                None => None,
            };
            result
        };

        let Some(mut file) = existing else {
            write_txn.abort()?;
            return Ok(Transition::NotFound);
        };

        let old_fingerprint = file.content_fingerprint.clone();
        if !f(&mut file) {
            write_txn.abort()?;
            return Ok(Transition::Unchanged(file));
        }
        file.updated_at = chrono::Utc::now();

        {
            let serialized = rmp_serde::to_vec_named(&file)?;
            let mut table = write_txn.open_table(FILES)?;
            table.insert(id, serialized.as_slice())?;
        }

        if old_fingerprint != file.content_fingerprint {
            let mut fp_table = write_txn.open_table(OWNER_FINGERPRINTS)?;
            if let Some(ref old) = old_fingerprint {
                index_remove(&mut fp_table, &fingerprint_key(&file.owner_id, old), id)?;
            }
            if let Some(ref new) = file.content_fingerprint {
                index_insert(&mut fp_table, &fingerprint_key(&file.owner_id, new), id)?;
            }
        }

        write_txn.commit()?;
        Ok(Transition::Applied(file))
    }

    /// Make `heir_id` the holder of its bytes and point every record of the
    /// same content that referenced one of `previous_holders` at the heir,
    /// all in one transaction. Returns the heir.
    pub fn promote_holder(
        &self,
        heir_id: &str,
        previous_holders: &[String],
    ) -> Result<Transition<FileRecord>, DatabaseError> {
        let write_txn = self.begin_write()?;

        let heir: Option<FileRecord> = {
            let table = write_txn.open_table(FILES)?;
            let result = match table.get(heir_id)? {
                Some(data) => Some(rmp_serde::from_slice(data.value())?),
                None => None,
            };
            result
        };
        let Some(mut heir) = heir else {
            write_txn.abort()?;
            return Ok(Transition::NotFound);
        };

        let now = chrono::Utc::now();
        let mut changed: Vec<FileRecord> = Vec::new();
        if heir.reference_of.is_some() {
            heir.reference_of = None;
            heir.physical_size = heir.logical_size;
            heir.updated_at = now;
            changed.push(heir.clone());
        }

        if let Some(ref fp) = heir.content_fingerprint {
            let fp_table = write_txn.open_table(OWNER_FINGERPRINTS)?;
            let files_table = write_txn.open_table(FILES)?;
            for id in read_index(&fp_table, &fingerprint_key(&heir.owner_id, fp))? {
                if id == heir.id {
                    continue;
                }
                let Some(data) = files_table.get(id.as_str())? else {
                    continue;
                };
                let mut sharer: FileRecord = rmp_serde::from_slice(data.value())?;
                let stale = sharer
                    .reference_of
                    .as_ref()
                    .is_some_and(|holder| previous_holders.contains(holder));
                if stale {
                    sharer.reference_of = Some(heir.id.clone());
                    sharer.updated_at = now;
                    changed.push(sharer);
                }
            }
        }

        if changed.is_empty() {
            write_txn.abort()?;
            return Ok(Transition::Unchanged(heir));
        }
        {
            let mut table = write_txn.open_table(FILES)?;
            for file in &changed {
                let serialized = rmp_serde::to_vec_named(file)?;
                table.insert(file.id.as_str(), serialized.as_slice())?;
            }
        }
        write_txn.commit()?;
        Ok(Transition::Applied(heir))
    }
}
