use std::cell::RefCell;

use log::info;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};

use crate::app_response::AppResponse;
use crate::document::{key_string, ID_FIELD};
use crate::events::{EventBus, Emitter};

pub const CHANGE_EVENT: &str = "change";
pub const LOGOUT_EVENT: &str = "logout";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserEvent {
    pub id: Option<String>,
    pub changed: Vec<String>,
}

#[derive(Default)]
struct Profile {
    id: Option<String>,
    fields: Map<String, JsonValue>,
}

/// The authenticated user's profile.
pub struct User {
    profile: RefCell<Profile>,
    events: EventBus<UserEvent>,
}

impl Emitter for User {
    type Payload = UserEvent;

    fn events(&self) -> &EventBus<UserEvent> {
        &self.events
    }
}

impl Default for User {
    fn default() -> Self {
        Self::new()
    }
}

impl User {
    pub fn new() -> Self {
        Self {
            profile: RefCell::new(Profile::default()),
            events: EventBus::new([CHANGE_EVENT, LOGOUT_EVENT]),
        }
    }

    /// Starts a session from a full user document. Any previous profile is
    /// discarded.
    pub fn authorize(&self, document: &JsonValue) -> Result<Vec<String>, AppResponse> {
        let id = document
            .get(ID_FIELD)
            .and_then(key_string)
            .ok_or_else(|| AppResponse::ValidationError("User document has no _id".to_string()))?;

        {
            let mut profile = self.profile.borrow_mut();
            profile.id = Some(id.clone());
            profile.fields.clear();
        }

        info!("Authorized user '{id}'");
        self.load(document)
    }

    /// Merges every field except `_id` into the live profile and emits
    /// `change` with the merged keys.
    pub fn load(&self, data: &JsonValue) -> Result<Vec<String>, AppResponse> {
        let JsonValue::Object(incoming) = data else {
            return Err(AppResponse::ValidationError(format!(
                "User data must be a JSON object, got: {data}"
            )));
        };

        let event = {
            let mut profile = self.profile.borrow_mut();
            let mut changed = Vec::new();
            for (key, value) in incoming.iter().filter(|(key, _)| key.as_str() != ID_FIELD) {
                profile.fields.insert(key.clone(), value.clone());
                changed.push(key.clone());
            }
            UserEvent {
                id: profile.id.clone(),
                changed,
            }
        };

        self.events.emit(CHANGE_EVENT, &event)?;
        Ok(event.changed)
    }

    pub fn logout(&self) -> Result<(), AppResponse> {
        let event = {
            let mut profile = self.profile.borrow_mut();
            let previous = std::mem::take(&mut *profile);
            UserEvent {
                id: previous.id,
                changed: previous.fields.keys().cloned().collect(),
            }
        };

        info!("User logged out");
        self.events.emit_all(&[LOGOUT_EVENT, CHANGE_EVENT], &event)
    }

    pub fn id(&self) -> Option<String> {
        self.profile.borrow().id.clone()
    }

    pub fn is_authorized(&self) -> bool {
        self.profile.borrow().id.is_some()
    }

    pub fn get(&self, field: &str) -> Option<JsonValue> {
        self.profile.borrow().fields.get(field).cloned()
    }

    /// Whether the profile's `permissions` map grants `permission`.
    pub fn can(&self, permission: &str) -> bool {
        self.profile
            .borrow()
            .fields
            .get("permissions")
            .and_then(|permissions| permissions.get(permission))
            .and_then(JsonValue::as_bool)
            .unwrap_or(false)
    }

    pub fn snapshot(&self) -> JsonValue {
        let profile = self.profile.borrow();
        let mut fields = profile.fields.clone();
        if let Some(id) = &profile.id {
            fields.insert(ID_FIELD.to_string(), JsonValue::String(id.clone()));
        }
        JsonValue::Object(fields)
    }
}
