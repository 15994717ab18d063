//! Mirror configuration and the static collection-definition table.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::app_response::AppResponse;
use crate::document::ID_FIELD;

/// Pushes addressed to this name update [`crate::settings::Settings`].
pub const SETTINGS_CHANNEL: &str = "settings";
/// Pushes addressed to this name update [`crate::user::User`].
pub const ACCOUNT_CHANNEL: &str = "account";
/// Collection whose documents also refresh the authenticated user.
pub const USERS_COLLECTION: &str = "users";

pub const DATABASE_PREFIX: &str = "virtool-";
pub const DEFAULT_MAP_SIZE: usize = 64 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectionDefinition {
    pub name: String,
    #[serde(default = "default_unique_keys")]
    pub unique_keys: Vec<String>,
    #[serde(default)]
    pub indices: Vec<String>,
    #[serde(default)]
    pub retain: bool,
}

fn default_unique_keys() -> Vec<String> {
    vec![ID_FIELD.to_string()]
}

impl CollectionDefinition {
    pub fn new(name: &str, retain: bool) -> Self {
        Self {
            name: name.to_string(),
            unique_keys: default_unique_keys(),
            indices: Vec::new(),
            retain,
        }
    }

    pub fn unique(mut self, field: &str) -> Self {
        if !self.unique_keys.iter().any(|k| k == field) {
            self.unique_keys.push(field.to_string());
        }
        self
    }

    pub fn index(mut self, field: &str) -> Self {
        if !self.indices.iter().any(|k| k == field) {
            self.indices.push(field.to_string());
        }
        self
    }

    /// Unique keys other than `_id`, which the document map enforces itself.
    pub fn extra_unique_keys(&self) -> impl Iterator<Item = &str> {
        self.unique_keys
            .iter()
            .map(String::as_str)
            .filter(|key| *key != ID_FIELD)
    }
}

/// The collections a Virtool client mirrors.
pub fn default_collections() -> Vec<CollectionDefinition> {
    vec![
        CollectionDefinition::new("jobs", true).index("task").index("user_id"),
        CollectionDefinition::new("samples", true).unique("name").index("group"),
        CollectionDefinition::new("analyses", true).index("sample_id"),
        CollectionDefinition::new("viruses", true).unique("name").index("modified"),
        CollectionDefinition::new("history", true).index("virus_id").index("index_id"),
        CollectionDefinition::new("indexes", true).unique("index_version"),
        CollectionDefinition::new("hosts", true),
        CollectionDefinition::new("files", false).index("file_type"),
        CollectionDefinition::new("groups", false),
        CollectionDefinition::new("users", false),
        CollectionDefinition::new("status", false),
    ]
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MirrorConfig {
    pub server_id: String,
    pub storage_root: PathBuf,
    #[serde(default = "default_map_size")]
    pub map_size: usize,
    #[serde(default = "default_collections")]
    pub collections: Vec<CollectionDefinition>,
}

fn default_map_size() -> usize {
    DEFAULT_MAP_SIZE
}

impl MirrorConfig {
    pub fn new(server_id: impl Into<String>, storage_root: impl AsRef<Path>) -> Self {
        Self {
            server_id: server_id.into(),
            storage_root: storage_root.as_ref().to_path_buf(),
            map_size: DEFAULT_MAP_SIZE,
            collections: default_collections(),
        }
    }

    pub fn with_collections(mut self, collections: Vec<CollectionDefinition>) -> Self {
        self.collections = collections;
        self
    }

    pub fn from_json(json: &str) -> Result<Self, AppResponse> {
        let config: MirrorConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// `"virtool-" + server_id`, the per-server local database name.
    pub fn database_name(&self) -> String {
        format!("{DATABASE_PREFIX}{}", self.server_id)
    }

    pub fn retained(&self) -> Vec<String> {
        self.collections
            .iter()
            .filter(|definition| definition.retain)
            .map(|definition| definition.name.clone())
            .collect()
    }

    pub fn validate(&self) -> Result<(), AppResponse> {
        if self.server_id.trim().is_empty() {
            return Err(AppResponse::ValidationError("server_id cannot be empty".to_string()));
        }

        let mut seen = BTreeSet::new();
        for definition in &self.collections {
            let name = definition.name.as_str();

            if name.trim().is_empty() {
                return Err(AppResponse::ValidationError(
                    "Collection names cannot be empty".to_string(),
                ));
            }

            if name == SETTINGS_CHANNEL || name == ACCOUNT_CHANNEL {
                return Err(AppResponse::ValidationError(format!(
                    "Collection name '{name}' is reserved"
                )));
            }

            if !seen.insert(name) {
                return Err(AppResponse::ValidationError(format!(
                    "Collection '{name}' is declared twice"
                )));
            }
        }

        Ok(())
    }
}
