//! A single mirrored collection.
//!
//! The document set is keyed by `_id` and carries one lookup table per extra
//! unique key and per secondary index. Only the [`crate::database::Database`]
//! mutates it, in response to backend pushes; view code reads it and writes
//! through [`Collection::request`].

use std::cell::RefCell;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::rc::Rc;

use log::debug;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::app_response::AppResponse;
use crate::config::CollectionDefinition;
use crate::dispatcher::{Dispatcher, RequestHandle};
use crate::document::{index_key, Document, ID_FIELD};
use crate::events::{EventBus, Emitter};

pub const CHANGE_EVENT: &str = "change";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Update,
    Remove,
    Clear,
}

/// Payload of a collection's `change` event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectionChange {
    pub collection: String,
    pub kind: ChangeKind,
    pub ids: Vec<String>,
}

/// Result of applying a batch of incoming documents.
#[derive(Debug, Default)]
pub(crate) struct Upserted {
    pub changed: Vec<Document>,
    pub rejected: Vec<AppResponse>,
}

#[derive(Default, Clone)]
struct CollectionState {
    documents: BTreeMap<String, Document>,
    // field -> value key -> _id
    unique: HashMap<String, HashMap<String, String>>,
    // field -> value key -> _ids
    indices: HashMap<String, BTreeMap<String, BTreeSet<String>>>,
}

impl CollectionState {
    fn for_definition(definition: &CollectionDefinition) -> Self {
        Self {
            documents: BTreeMap::new(),
            unique: definition
                .extra_unique_keys()
                .map(|field| (field.to_string(), HashMap::new()))
                .collect(),
            indices: definition
                .indices
                .iter()
                .map(|field| (field.clone(), BTreeMap::new()))
                .collect(),
        }
    }

    fn check_unique(&self, id: &str, document: &Document) -> Result<(), AppResponse> {
        for (field, values) in &self.unique {
            let Some(key) = document.get(field).and_then(index_key) else {
                continue;
            };

            if let Some(owner) = values.get(&key) {
                if owner != id {
                    return Err(AppResponse::ValidationError(format!(
                        "Unique key '{field}' = {key} already belongs to '{owner}', rejected '{id}'"
                    )));
                }
            }
        }
        Ok(())
    }

    fn link(&mut self, id: &str, document: &Document) {
        for (field, values) in self.unique.iter_mut() {
            if let Some(key) = document.get(field).and_then(index_key) {
                values.insert(key, id.to_string());
            }
        }
        for (field, index) in self.indices.iter_mut() {
            if let Some(key) = document.get(field).and_then(index_key) {
                index.entry(key).or_default().insert(id.to_string());
            }
        }
    }

    fn unlink(&mut self, id: &str, document: &Document) {
        for (field, values) in self.unique.iter_mut() {
            if let Some(key) = document.get(field).and_then(index_key) {
                if values.get(&key).is_some_and(|owner| owner == id) {
                    values.remove(&key);
                }
            }
        }
        for (field, index) in self.indices.iter_mut() {
            if let Some(key) = document.get(field).and_then(index_key) {
                if let Some(ids) = index.get_mut(&key) {
                    ids.remove(id);
                    if ids.is_empty() {
                        index.remove(&key);
                    }
                }
            }
        }
    }

    fn insert(&mut self, id: String, document: Document) {
        if let Some(previous) = self.documents.remove(&id) {
            self.unlink(&id, &previous);
        }
        self.link(&id, &document);
        self.documents.insert(id, document);
    }

    fn remove(&mut self, id: &str) -> Option<Document> {
        let previous = self.documents.remove(id)?;
        self.unlink(id, &previous);
        Some(previous)
    }

    fn clear(&mut self) -> Vec<String> {
        let ids = self.documents.keys().cloned().collect();
        self.documents.clear();
        self.unique.values_mut().for_each(HashMap::clear);
        self.indices.values_mut().for_each(BTreeMap::clear);
        ids
    }

    fn upsert(&mut self, documents: Vec<Document>) -> Upserted {
        let mut outcome = Upserted::default();

        for document in documents {
            let id = match document.require_id() {
                Ok(id) => id,
                Err(e) => {
                    outcome.rejected.push(e);
                    continue;
                }
            };

            if let Some(existing) = self.documents.get(&id) {
                if existing == &document {
                    continue;
                }
                if let (Some(stored), Some(incoming)) = (existing.version(), document.version()) {
                    if incoming < stored {
                        debug!("Ignoring stale '{}' v{} (have v{})", id, incoming, stored);
                        continue;
                    }
                }
            }

            if let Err(e) = self.check_unique(&id, &document) {
                outcome.rejected.push(e);
                continue;
            }

            self.insert(id, document.clone());
            outcome.changed.push(document);
        }

        outcome
    }
}

pub struct Collection {
    definition: CollectionDefinition,
    state: RefCell<CollectionState>,
    events: EventBus<CollectionChange>,
    dispatcher: Rc<Dispatcher>,
}

impl Emitter for Collection {
    type Payload = CollectionChange;

    fn events(&self) -> &EventBus<CollectionChange> {
        &self.events
    }
}

impl Collection {
    pub fn new(definition: CollectionDefinition, dispatcher: Rc<Dispatcher>) -> Self {
        Self {
            state: RefCell::new(CollectionState::for_definition(&definition)),
            events: EventBus::new([CHANGE_EVENT]),
            definition,
            dispatcher,
        }
    }

    pub fn name(&self) -> &str {
        &self.definition.name
    }

    pub fn definition(&self) -> &CollectionDefinition {
        &self.definition
    }

    pub fn retain(&self) -> bool {
        self.definition.retain
    }

    pub fn len(&self) -> usize {
        self.state.borrow().documents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.borrow().documents.is_empty()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.state.borrow().documents.contains_key(id)
    }

    pub fn get(&self, id: &str) -> Option<Document> {
        self.state.borrow().documents.get(id).cloned()
    }

    /// All documents, ordered by `_id`.
    pub fn find_all(&self) -> Vec<Document> {
        self.state.borrow().documents.values().cloned().collect()
    }

    /// Documents whose `field` equals `value`. Uses the unique-key or
    /// secondary index for declared fields and scans otherwise.
    pub fn find_by(&self, field: &str, value: &JsonValue) -> Vec<Document> {
        let state = self.state.borrow();

        if field == ID_FIELD {
            return crate::document::key_string(value)
                .and_then(|id| state.documents.get(&id).cloned())
                .into_iter()
                .collect();
        }

        let Some(key) = index_key(value) else {
            return state
                .documents
                .values()
                .filter(|document| document.get(field).map_or(true, JsonValue::is_null))
                .cloned()
                .collect();
        };

        if let Some(values) = state.unique.get(field) {
            return values
                .get(&key)
                .and_then(|id| state.documents.get(id).cloned())
                .into_iter()
                .collect();
        }

        if let Some(index) = state.indices.get(field) {
            return index
                .get(&key)
                .map(|ids| {
                    ids.iter()
                        .filter_map(|id| state.documents.get(id).cloned())
                        .collect()
                })
                .unwrap_or_default();
        }

        state
            .documents
            .values()
            .filter(|document| document.get(field) == Some(value))
            .cloned()
            .collect()
    }

    /// Forwards `method` with `data` to the backend for this collection. The
    /// local document set is only touched by the push that follows.
    pub fn request(&self, method: &str, data: JsonValue) -> RequestHandle {
        self.dispatcher.request(self.name(), method, data)
    }

    pub(crate) fn upsert(&self, documents: Vec<Document>) -> Upserted {
        self.state.borrow_mut().upsert(documents)
    }

    /// Stages `documents` on a copy of the document set and hands the
    /// accepted ones to `persist`. The live set only changes if `persist`
    /// succeeds.
    pub(crate) fn upsert_with<F>(
        &self,
        documents: Vec<Document>,
        persist: F,
    ) -> Result<Upserted, AppResponse>
    where
        F: FnOnce(&[Document]) -> Result<(), AppResponse>,
    {
        let mut staged = self.state.borrow().clone();
        let outcome = staged.upsert(documents);

        if !outcome.changed.is_empty() {
            persist(&outcome.changed)?;
            *self.state.borrow_mut() = staged;
        }
        Ok(outcome)
    }

    /// Replaces the whole document set once `persist` accepts the new
    /// contents. Returns the ids that were cleared along with the outcome.
    pub(crate) fn replace_with<F>(
        &self,
        documents: Vec<Document>,
        persist: F,
    ) -> Result<(Vec<String>, Upserted), AppResponse>
    where
        F: FnOnce(&[Document]) -> Result<(), AppResponse>,
    {
        let mut staged = CollectionState::for_definition(&self.definition);
        let outcome = staged.upsert(documents);
        persist(&outcome.changed)?;

        let previous = std::mem::replace(&mut *self.state.borrow_mut(), staged);
        Ok((previous.documents.into_keys().collect(), outcome))
    }

    pub(crate) fn remove(&self, ids: &[String]) -> Vec<String> {
        let mut state = self.state.borrow_mut();
        ids.iter()
            .filter(|id| state.remove(id).is_some())
            .cloned()
            .collect()
    }

    pub(crate) fn clear(&self) -> Vec<String> {
        self.state.borrow_mut().clear()
    }

    /// Emits `change` unless nothing changed. Must be called with no borrow
    /// of the document set outstanding so listeners can read the collection.
    pub(crate) fn notify(&self, kind: ChangeKind, ids: Vec<String>) -> Result<(), AppResponse> {
        if ids.is_empty() {
            return Ok(());
        }

        let change = CollectionChange {
            collection: self.name().to_string(),
            kind,
            ids,
        };
        self.events.emit(CHANGE_EVENT, &change)
    }
}
