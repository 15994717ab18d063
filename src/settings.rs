use std::cell::RefCell;
use std::rc::Rc;

use log::debug;
use serde_json::{Map, Value as JsonValue};

use crate::app_response::AppResponse;
use crate::config::SETTINGS_CHANNEL;
use crate::dispatcher::{Dispatcher, RequestHandle};
use crate::events::{EventBus, Emitter};

pub const CHANGE_EVENT: &str = "change";

/// Server settings mirrored as a flat key-value map.
///
/// Reads are local. Writes go to the backend and only land here when the
/// resulting push comes back through [`Settings::update`].
pub struct Settings {
    values: RefCell<Map<String, JsonValue>>,
    events: EventBus<Vec<String>>,
    dispatcher: Rc<Dispatcher>,
}

impl Emitter for Settings {
    /// Keys whose values changed.
    type Payload = Vec<String>;

    fn events(&self) -> &EventBus<Vec<String>> {
        &self.events
    }
}

impl Settings {
    pub fn new(dispatcher: Rc<Dispatcher>) -> Self {
        Self {
            values: RefCell::new(Map::new()),
            events: EventBus::new([CHANGE_EVENT]),
            dispatcher,
        }
    }

    /// Merges `data` into the local map and emits `change` with the keys that
    /// actually changed. Returns those keys.
    pub fn update(&self, data: &JsonValue) -> Result<Vec<String>, AppResponse> {
        let JsonValue::Object(incoming) = data else {
            return Err(AppResponse::ValidationError(format!(
                "Settings update must be a JSON object, got: {data}"
            )));
        };

        let changed: Vec<String> = {
            let mut values = self.values.borrow_mut();
            incoming
                .iter()
                .filter_map(|(key, value)| match values.get(key) {
                    Some(current) if current == value => None,
                    _ => {
                        values.insert(key.clone(), value.clone());
                        Some(key.clone())
                    }
                })
                .collect()
        };

        if !changed.is_empty() {
            debug!("Settings changed: {}", changed.join(", "));
            self.events.emit(CHANGE_EVENT, &changed)?;
        }

        Ok(changed)
    }

    pub fn get(&self, key: &str) -> Option<JsonValue> {
        self.values.borrow().get(key).cloned()
    }

    /// Asks the backend to set `key`. The local value is unchanged until the
    /// backend pushes the new settings.
    pub fn set(&self, key: &str, value: JsonValue) -> RequestHandle {
        let mut data = Map::new();
        data.insert(key.to_string(), value);
        self.dispatcher.request(SETTINGS_CHANNEL, "set", JsonValue::Object(data))
    }

    pub fn snapshot(&self) -> JsonValue {
        JsonValue::Object(self.values.borrow().clone())
    }
}
