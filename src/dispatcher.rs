//! Request path to the backend and correlation of its responses.
//!
//! Every call to [`Dispatcher::request`] allocates a fresh [`RequestId`] and
//! hands a [`RequestEnvelope`] to the [`Transport`]. The backend answers with
//! [`ResponseMessage`]s carrying the same id, which [`Dispatcher::resolve`]
//! routes to the matching [`RequestHandle`]. Responses may arrive in any
//! order; a response only ever touches the request with its own id.

use std::cell::{Cell, RefCell};
use std::collections::{HashMap, VecDeque};
use std::rc::Rc;

use log::{debug, warn};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::app_response::AppResponse;

pub type RequestId = u64;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestEnvelope {
    pub id: RequestId,
    pub collection: String,
    pub method: String,
    #[serde(default)]
    pub data: JsonValue,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseStatus {
    Success,
    Failure,
    /// Progress for a request that has not settled yet.
    Update,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseMessage {
    pub id: RequestId,
    pub status: ResponseStatus,
    #[serde(default)]
    pub data: JsonValue,
}

/// Outbound half of the backend connection.
pub trait Transport {
    fn send(&self, envelope: &RequestEnvelope) -> Result<(), AppResponse>;
}

/// Queue-backed transport for hosts that poll for outgoing requests.
#[derive(Default)]
pub struct Outbox {
    queue: RefCell<VecDeque<RequestEnvelope>>,
}

impl Outbox {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn drain(&self) -> Vec<RequestEnvelope> {
        self.queue.borrow_mut().drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.queue.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.borrow().is_empty()
    }
}

impl Transport for Outbox {
    fn send(&self, envelope: &RequestEnvelope) -> Result<(), AppResponse> {
        self.queue.borrow_mut().push_back(envelope.clone());
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum RequestStatus {
    Pending,
    Succeeded(JsonValue),
    Failed(AppResponse),
}

type SuccessHook = Box<dyn FnOnce(&JsonValue)>;
type FailureHook = Box<dyn FnOnce(&AppResponse)>;
type UpdateHook = Rc<dyn Fn(&JsonValue)>;

struct RequestSlot {
    status: RequestStatus,
    on_success: Vec<SuccessHook>,
    on_failure: Vec<FailureHook>,
    on_update: Vec<UpdateHook>,
}

impl RequestSlot {
    fn pending() -> Self {
        Self {
            status: RequestStatus::Pending,
            on_success: Vec::new(),
            on_failure: Vec::new(),
            on_update: Vec::new(),
        }
    }
}

/// Caller-side view of one in-flight request.
///
/// Hooks registered after the request settled run immediately with the
/// settled value if they match the outcome and are dropped otherwise.
#[derive(Clone)]
pub struct RequestHandle {
    id: RequestId,
    slot: Rc<RefCell<RequestSlot>>,
}

impl RequestHandle {
    pub fn id(&self) -> RequestId {
        self.id
    }

    pub fn status(&self) -> RequestStatus {
        self.slot.borrow().status.clone()
    }

    pub fn is_pending(&self) -> bool {
        matches!(self.slot.borrow().status, RequestStatus::Pending)
    }

    /// Hooks registered after a failure are dropped without running.
    pub fn on_success(&self, hook: impl FnOnce(&JsonValue) + 'static) -> &Self {
        let status = self.status();
        match status {
            RequestStatus::Pending => self.slot.borrow_mut().on_success.push(Box::new(hook)),
            RequestStatus::Succeeded(data) => hook(&data),
            RequestStatus::Failed(_) => {}
        }
        self
    }

    /// Hooks registered after a success are dropped without running.
    pub fn on_failure(&self, hook: impl FnOnce(&AppResponse) + 'static) -> &Self {
        let status = self.status();
        match status {
            RequestStatus::Pending => self.slot.borrow_mut().on_failure.push(Box::new(hook)),
            RequestStatus::Failed(error) => hook(&error),
            RequestStatus::Succeeded(_) => {}
        }
        self
    }

    /// Progress hooks only matter while the request is pending.
    pub fn on_update(&self, hook: impl Fn(&JsonValue) + 'static) -> &Self {
        if self.is_pending() {
            self.slot.borrow_mut().on_update.push(Rc::new(hook));
        }
        self
    }

    #[cfg(test)]
    pub(crate) fn hook_count(&self) -> usize {
        let slot = self.slot.borrow();
        slot.on_success.len() + slot.on_failure.len() + slot.on_update.len()
    }

    fn settle(&self, status: RequestStatus) {
        let (successes, failures) = {
            let mut slot = self.slot.borrow_mut();
            if !matches!(slot.status, RequestStatus::Pending) {
                return;
            }
            slot.status = status.clone();
            slot.on_update.clear();
            (
                std::mem::take(&mut slot.on_success),
                std::mem::take(&mut slot.on_failure),
            )
        };

        match status {
            RequestStatus::Succeeded(data) => successes.into_iter().for_each(|hook| hook(&data)),
            RequestStatus::Failed(error) => failures.into_iter().for_each(|hook| hook(&error)),
            RequestStatus::Pending => {}
        }
    }

    fn progress(&self, data: &JsonValue) {
        let hooks = self.slot.borrow().on_update.clone();
        for hook in hooks {
            hook(data);
        }
    }
}

pub struct Dispatcher {
    transport: Rc<dyn Transport>,
    next_id: Cell<RequestId>,
    pending: RefCell<HashMap<RequestId, RequestHandle>>,
}

impl Dispatcher {
    pub fn new(transport: Rc<dyn Transport>) -> Self {
        Self {
            transport,
            next_id: Cell::new(1),
            pending: RefCell::new(HashMap::new()),
        }
    }

    /// Sends `{id, collection, method, data}` to the backend. A transport
    /// failure does not surface as an `Err`; the returned handle is already
    /// failed and its failure hooks fire on registration.
    pub fn request(&self, collection: &str, method: &str, data: JsonValue) -> RequestHandle {
        let id = self.next_id.get();
        self.next_id.set(id + 1);

        let handle = RequestHandle {
            id,
            slot: Rc::new(RefCell::new(RequestSlot::pending())),
        };

        let envelope = RequestEnvelope {
            id,
            collection: collection.to_string(),
            method: method.to_string(),
            data,
        };

        match self.transport.send(&envelope) {
            Ok(()) => {
                debug!("Sent request {id}: {collection}.{method}");
                self.pending.borrow_mut().insert(id, handle.clone());
            }
            Err(e) => {
                warn!("Transport rejected request {id} ({collection}.{method}): {e}");
                handle.settle(RequestStatus::Failed(AppResponse::RequestFailed(e.to_string())));
            }
        }

        handle
    }

    /// Routes a backend response to its request. Returns `false` for ids
    /// with no pending request, which are logged and otherwise ignored.
    pub fn resolve(&self, response: ResponseMessage) -> bool {
        let handle = match response.status {
            ResponseStatus::Update => self.pending.borrow().get(&response.id).cloned(),
            _ => self.pending.borrow_mut().remove(&response.id),
        };

        let Some(handle) = handle else {
            warn!("Dropping response for unknown request id {}", response.id);
            return false;
        };

        match response.status {
            ResponseStatus::Update => handle.progress(&response.data),
            ResponseStatus::Success => handle.settle(RequestStatus::Succeeded(response.data)),
            ResponseStatus::Failure => {
                let reason = match &response.data {
                    JsonValue::String(message) => message.clone(),
                    other => other.to_string(),
                };
                handle.settle(RequestStatus::Failed(AppResponse::RequestFailed(reason)));
            }
        }

        true
    }

    pub fn pending_count(&self) -> usize {
        self.pending.borrow().len()
    }

    /// Fails every request still waiting on the backend.
    pub fn fail_all_pending(&self, reason: &str) -> usize {
        let drained: Vec<RequestHandle> = self.pending.borrow_mut().drain().map(|(_, h)| h).collect();
        let count = drained.len();

        for handle in drained {
            handle.settle(RequestStatus::Failed(AppResponse::RequestFailed(reason.to_string())));
        }

        count
    }
}
