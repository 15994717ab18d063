//! The set of mirrored collections and their local persistence.

use std::collections::BTreeMap;
use std::rc::Rc;

use log::{info, warn};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::app_response::AppResponse;
use crate::collection::{ChangeKind, Collection};
use crate::config::MirrorConfig;
use crate::dispatcher::Dispatcher;
use crate::document::{key_string, Document};
use crate::persistent_storage::{PersistentStorage, RestoredCollections};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PushOperation {
    /// Upsert one document or an array of documents.
    Update,
    /// Remove one id or an array of ids.
    Remove,
    /// Replace the whole collection with the given documents.
    Reset,
    /// End the authenticated session. Only meaningful on the account channel.
    Logout,
}

/// An unsolicited backend message carrying a state change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PushMessage {
    pub collection: String,
    pub operation: PushOperation,
    #[serde(default)]
    pub data: JsonValue,
}

/// What a push actually changed. Stale, unchanged and rejected documents
/// are not part of it.
#[derive(Debug, Clone, PartialEq)]
pub struct AppliedPush {
    pub kind: ChangeKind,
    pub ids: Vec<String>,
    pub documents: Vec<Document>,
}

pub struct Database {
    collections: BTreeMap<String, Rc<Collection>>,
    storage: PersistentStorage,
}

impl Database {
    /// Opens the local store, builds every declared collection and loads
    /// retained collections from disk before returning.
    pub fn open(config: &MirrorConfig, dispatcher: Rc<Dispatcher>) -> Result<Self, AppResponse> {
        config.validate()?;

        let storage = PersistentStorage::open(
            &config.storage_root,
            &config.database_name(),
            &config.retained(),
            config.map_size,
        )?;

        let collections: BTreeMap<String, Rc<Collection>> = config
            .collections
            .iter()
            .map(|definition| {
                let collection = Collection::new(definition.clone(), dispatcher.clone());
                (definition.name.clone(), Rc::new(collection))
            })
            .collect();

        let mut restored: Option<RestoredCollections> = None;
        storage.restore_collections(|documents| restored = Some(documents))?;

        for (name, documents) in restored.unwrap_or_default() {
            let Some(collection) = collections.get(&name) else {
                continue;
            };
            let outcome = collection.upsert(documents);
            for rejection in outcome.rejected {
                warn!("Skipped stored document in '{name}': {rejection}");
            }
        }

        info!(
            "Mirror database '{}' open with {} collection(s)",
            config.database_name(),
            collections.len()
        );

        Ok(Self {
            collections,
            storage,
        })
    }

    pub fn collection(&self, name: &str) -> Option<Rc<Collection>> {
        self.collections.get(name).cloned()
    }

    pub fn require(&self, name: &str) -> Result<Rc<Collection>, AppResponse> {
        self.collection(name)
            .ok_or_else(|| AppResponse::NotFound(format!("No collection named '{name}'")))
    }

    pub fn names(&self) -> Vec<String> {
        self.collections.keys().cloned().collect()
    }

    pub fn storage(&self) -> &PersistentStorage {
        &self.storage
    }

    /// Applies a backend push to its collection and then emits `change`.
    ///
    /// Updates and resets of retained collections are written to local
    /// storage first; if that write fails the in-memory collection is left
    /// untouched and the error is returned.
    pub fn apply(&self, push: &PushMessage) -> Result<AppliedPush, AppResponse> {
        let collection = self.require(&push.collection)?;
        let name = collection.name().to_string();
        let retain = collection.retain();

        let applied = match push.operation {
            PushOperation::Update => {
                let outcome = collection.upsert_with(documents_from(&push.data)?, |changed| {
                    if retain {
                        self.storage.add_many(&name, changed)
                    } else {
                        Ok(())
                    }
                })?;
                for rejection in &outcome.rejected {
                    warn!("Rejected document pushed to '{name}': {rejection}");
                }
                AppliedPush {
                    kind: ChangeKind::Update,
                    ids: outcome.changed.iter().filter_map(Document::id).collect(),
                    documents: outcome.changed,
                }
            }
            PushOperation::Remove => {
                let removed = collection.remove(&ids_from(&push.data)?);
                if retain {
                    for id in &removed {
                        self.storage.remove(&name, id);
                    }
                }
                AppliedPush {
                    kind: ChangeKind::Remove,
                    ids: removed,
                    documents: Vec::new(),
                }
            }
            PushOperation::Reset => {
                let (mut ids, outcome) =
                    collection.replace_with(documents_from(&push.data)?, |documents| {
                        if retain {
                            self.storage.replace_collection(&name, documents)
                        } else {
                            Ok(())
                        }
                    })?;
                for rejection in &outcome.rejected {
                    warn!("Rejected document in reset of '{name}': {rejection}");
                }
                ids.extend(outcome.changed.iter().filter_map(Document::id));
                ids.sort();
                ids.dedup();
                AppliedPush {
                    kind: ChangeKind::Clear,
                    ids,
                    documents: outcome.changed,
                }
            }
            PushOperation::Logout => {
                return Err(AppResponse::BadRequest(format!(
                    "Operation 'logout' is not valid for collection '{name}'"
                )))
            }
        };

        collection.notify(applied.kind, applied.ids.clone())?;
        Ok(applied)
    }

    /// Page-unload teardown: clears every transient collection and flushes
    /// the local store so retained collections survive the reload.
    pub fn unload(&self) -> Result<(), AppResponse> {
        for collection in self.collections.values().filter(|c| !c.retain()) {
            let ids = collection.clear();
            collection.notify(ChangeKind::Clear, ids)?;
        }

        self.storage.sync()?;
        info!("Unloaded mirror database; transient collections cleared");
        Ok(())
    }

    /// Closes the local store and deletes it from disk.
    pub fn delete_local_data(self) -> Result<(), AppResponse> {
        self.storage.delete_database()
    }
}

fn documents_from(data: &JsonValue) -> Result<Vec<Document>, AppResponse> {
    match data {
        JsonValue::Array(items) => items.iter().cloned().map(Document::from_value).collect(),
        JsonValue::Null => Ok(Vec::new()),
        other => Ok(vec![Document::from_value(other.clone())?]),
    }
}

fn ids_from(data: &JsonValue) -> Result<Vec<String>, AppResponse> {
    let values: Vec<&JsonValue> = match data {
        JsonValue::Array(items) => items.iter().collect(),
        other => vec![other],
    };

    values
        .into_iter()
        .map(|value| {
            key_string(value)
                .ok_or_else(|| AppResponse::ValidationError(format!("Invalid document id: {value}")))
        })
        .collect()
}
