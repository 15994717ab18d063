use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::thread;

use lmdb::{Cursor, Database, DatabaseFlags, Environment, Transaction, WriteFlags};
use log::{debug, info, warn};

use crate::app_response::AppResponse;
use crate::document::Document;
use crate::join::CompletionJoin;

/// Documents read back from local storage, keyed by collection name.
pub type RestoredCollections = BTreeMap<String, Vec<Document>>;

/// Durable storage for retained collections.
///
/// One LMDB environment per server instance lives at
/// `<root>/<database_name>.lmdb`. Inside it every retained collection has a
/// named database holding its documents as JSON, keyed by `_id`.
pub struct PersistentStorage {
    env: Environment,
    stores: BTreeMap<String, Database>,
    path: PathBuf,
}

impl PersistentStorage {
    pub fn open(
        root: &Path,
        database_name: &str,
        retained: &[String],
        map_size: usize,
    ) -> Result<Self, AppResponse> {
        let path = root.join(format!("{database_name}.lmdb"));
        fs::create_dir_all(&path)?;

        info!("Opening local store at {}", path.display());

        let env = Environment::new()
            .set_max_dbs(retained.len().max(1) as u32)
            .set_map_size(map_size)
            .open(&path)?;

        let mut stores = BTreeMap::new();
        for name in retained {
            let db = env.create_db(Some(name.as_str()), DatabaseFlags::empty())?;
            stores.insert(name.clone(), db);
        }

        info!("Local store ready with {} retained collection(s)", stores.len());

        Ok(Self { env, stores, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn retained(&self) -> Vec<String> {
        self.stores.keys().cloned().collect()
    }

    pub fn is_retained(&self, collection: &str) -> bool {
        self.stores.contains_key(collection)
    }

    fn store(&self, collection: &str) -> Result<Database, AppResponse> {
        self.stores.get(collection).copied().ok_or_else(|| {
            AppResponse::NotFound(format!("No local store for collection '{collection}'"))
        })
    }

    /// Reads every retained store and calls `on_complete` once all of them
    /// have been exhausted.
    ///
    /// Each store is scanned on its own scoped thread with its own read
    /// transaction. The scans report into a [`CompletionJoin`] keyed by the
    /// retained collection names, so the callback cannot fire before the last
    /// scan lands and fires exactly once. If any scan fails, the first error
    /// is returned and the callback is not invoked.
    pub fn restore_collections<F>(&self, on_complete: F) -> Result<(), AppResponse>
    where
        F: FnOnce(RestoredCollections),
    {
        let mut join = CompletionJoin::new(self.stores.keys().cloned(), on_complete);

        let scans: Vec<(String, Result<Vec<Document>, AppResponse>)> = thread::scope(|scope| {
            let workers: Vec<_> = self
                .stores
                .iter()
                .map(|(name, db)| {
                    let env = &self.env;
                    let db = *db;
                    (name.clone(), scope.spawn(move || scan_store(env, db)))
                })
                .collect();

            workers
                .into_iter()
                .map(|(name, worker)| {
                    let result = worker.join().unwrap_or_else(|_| {
                        Err(AppResponse::DatabaseError(format!("Restore of '{name}' panicked")))
                    });
                    (name, result)
                })
                .collect()
        });

        for (name, result) in scans {
            let documents = result?;
            info!("Restored {} document(s) into '{}'", documents.len(), name);
            join.complete(&name, documents)?;
        }

        Ok(())
    }

    /// Upserts one document by `_id`. A document without an identity is
    /// rejected before any write transaction is opened.
    pub fn add(&self, collection: &str, document: &Document) -> Result<(), AppResponse> {
        self.add_many(collection, std::slice::from_ref(document))
    }

    /// Upserts a batch of documents in a single write transaction.
    pub fn add_many(&self, collection: &str, documents: &[Document]) -> Result<(), AppResponse> {
        let db = self.store(collection)?;

        let mut encoded = Vec::with_capacity(documents.len());
        for document in documents {
            encoded.push((document.require_id()?, document.to_vec()?));
        }

        let mut txn = self.env.begin_rw_txn()?;
        for (id, bytes) in &encoded {
            txn.put(db, id, bytes, WriteFlags::empty())?;
        }
        txn.commit()?;

        debug!("Stored {} document(s) in '{}'", encoded.len(), collection);
        Ok(())
    }

    /// Deletes one document by `_id`. Failures are logged and reported as
    /// `false`; the authoritative copy lives on the backend.
    pub fn remove(&self, collection: &str, id: &str) -> bool {
        match self.try_remove(collection, id) {
            Ok(removed) => removed,
            Err(e) => {
                warn!("Failed to remove '{id}' from local store '{collection}': {e}");
                false
            }
        }
    }

    fn try_remove(&self, collection: &str, id: &str) -> Result<bool, AppResponse> {
        let db = self.store(collection)?;
        let mut txn = self.env.begin_rw_txn()?;

        match txn.del(db, &id, None) {
            Ok(()) => {
                txn.commit()?;
                Ok(true)
            }
            Err(lmdb::Error::NotFound) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    pub fn get(&self, collection: &str, id: &str) -> Result<Option<Document>, AppResponse> {
        let db = self.store(collection)?;
        let txn = self.env.begin_ro_txn()?;

        let document = match txn.get(db, &id) {
            Ok(bytes) => Some(Document::from_slice(bytes)?),
            Err(lmdb::Error::NotFound) => None,
            Err(e) => return Err(e.into()),
        };
        Ok(document)
    }

    pub fn count(&self, collection: &str) -> Result<usize, AppResponse> {
        Ok(scan_store(&self.env, self.store(collection)?)?.len())
    }

    pub fn clear_collection(&self, collection: &str) -> Result<(), AppResponse> {
        let db = self.store(collection)?;
        let mut txn = self.env.begin_rw_txn()?;
        txn.clear_db(db)?;
        txn.commit()?;
        Ok(())
    }

    /// Replaces the contents of a store with `documents` in one transaction.
    pub fn replace_collection(
        &self,
        collection: &str,
        documents: &[Document],
    ) -> Result<(), AppResponse> {
        let db = self.store(collection)?;

        let mut encoded = Vec::with_capacity(documents.len());
        for document in documents {
            encoded.push((document.require_id()?, document.to_vec()?));
        }

        let mut txn = self.env.begin_rw_txn()?;
        txn.clear_db(db)?;
        for (id, bytes) in &encoded {
            txn.put(db, id, bytes, WriteFlags::empty())?;
        }
        txn.commit()?;
        Ok(())
    }

    pub fn sync(&self) -> Result<(), AppResponse> {
        self.env.sync(true)?;
        Ok(())
    }

    /// Closes the environment and removes the whole local database.
    pub fn delete_database(self) -> Result<(), AppResponse> {
        let PersistentStorage { env, stores, path } = self;
        drop(stores);
        drop(env);

        if path.exists() {
            fs::remove_dir_all(&path)?;
        }

        info!("Deleted local store at {}", path.display());
        Ok(())
    }
}

/// Reads every document of one store. A fresh cursor is unpositioned, so
/// `iter` starts at the first entry and yields nothing for an empty store.
fn scan_store(env: &Environment, db: Database) -> Result<Vec<Document>, AppResponse> {
    let txn = env.begin_ro_txn()?;
    let mut documents = Vec::new();
    {
        let mut cursor = txn.open_ro_cursor(db)?;
        for (_key, value) in cursor.iter() {
            documents.push(Document::from_slice(value)?);
        }
    }
    txn.commit()?;
    Ok(documents)
}
