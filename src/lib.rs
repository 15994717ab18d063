//! # Virtool Mirror Core
//!
//! A client-side mirror of server-owned collections for the Virtool
//! laboratory platform. Documents pushed by the backend are kept in memory
//! per collection, retained collections are persisted in LMDB so they survive
//! a reload, and every mutation raises a `change` event that views subscribe
//! to. Writes never touch the mirror directly: they are sent to the backend
//! as correlated requests and come back as pushes.
//!
//! ## Features
//!
//! - **Named collections**: declared unique keys and secondary indices per collection
//! - **Change events**: fail-fast `on`/`off`/`emit` with a fixed set of event names
//! - **LMDB persistence**: retained collections restored concurrently on open
//! - **Request correlation**: every request carries its own id, responses may arrive in any order
//! - **FFI-friendly**: a JSON-in/JSON-out C surface for hosts that poll
//!
//! ## Quick Start
//!
//! ```no_run
//! use std::rc::Rc;
//! use virtool_mirror_core::config::MirrorConfig;
//! use virtool_mirror_core::dispatcher::Outbox;
//! use virtool_mirror_core::mirror::Mirror;
//!
//! let outbox = Rc::new(Outbox::new());
//! let config = MirrorConfig::new("lab-server-1", "/tmp/virtool");
//! let mirror = Mirror::open(&config, outbox.clone())?;
//!
//! mirror.receive_json(
//!     r#"{"type":"push","collection":"samples","operation":"update","data":{"_id":"s1","name":"Sample 1"}}"#,
//! )?;
//!
//! let samples = mirror.collection("samples").expect("declared collection");
//! samples.request("remove", serde_json::json!({"_id": "s1"}));
//! assert_eq!(outbox.drain().len(), 1);
//! # Ok::<(), virtool_mirror_core::app_response::AppResponse>(())
//! ```
//!
//! ## FFI Functions
//!
//! - [`create_mirror`] - Open a mirror from a JSON [`MirrorConfig`]
//! - [`receive_message`] - Feed one backend push or response
//! - [`send_request`] - Queue a request for the backend
//! - [`drain_requests`] - Take every queued request
//! - [`get_all`] / [`get_by_id`] / [`find_by`] - Read collections
//! - [`get_settings`] / [`get_user`] - Read settings and the current user
//! - [`unload_mirror`] - Clear transient collections
//! - [`close_mirror`] / [`reset_mirror`] - Release the mirror, optionally deleting local data
//! - [`free_response`] - Release a string returned by any of the above

pub mod app_response;
pub mod collection;
pub mod config;
pub mod database;
pub mod dispatcher;
pub mod document;
pub mod events;
pub mod join;
pub mod mirror;
pub mod persistent_storage;
pub mod settings;
pub mod user;

use std::ffi::{CStr, CString};
use std::os::raw::c_char;
use std::rc::Rc;

use log::{info, warn};
use serde::Deserialize;
use serde_json::Value as JsonValue;

use crate::app_response::AppResponse;
use crate::config::MirrorConfig;
use crate::dispatcher::Outbox;
use crate::mirror::Mirror;

/// Mirror plus the outbox an FFI host drains.
pub struct MirrorState {
    pub mirror: Mirror,
    pub outbox: Rc<Outbox>,
}

impl MirrorState {
    pub fn open(config: &MirrorConfig) -> Result<Self, AppResponse> {
        let outbox = Rc::new(Outbox::new());
        let mirror = Mirror::open(config, outbox.clone())?;
        Ok(Self { mirror, outbox })
    }
}

#[derive(Deserialize)]
struct OutgoingRequest {
    collection: String,
    method: String,
    #[serde(default)]
    data: JsonValue,
}

/// Opens a mirror from a JSON [`MirrorConfig`].
///
/// # Returns
///
/// A pointer to the [`MirrorState`], or null if the config is invalid or the
/// local store cannot be opened. Release it with [`close_mirror`] or
/// [`reset_mirror`].
///
/// # Examples
///
/// ```no_run
/// use std::ffi::CString;
/// use virtool_mirror_core::create_mirror;
///
/// let config = CString::new(r#"{"server_id":"abc","storage_root":"/tmp/virtool"}"#).unwrap();
/// let state = create_mirror(config.as_ptr());
/// assert!(!state.is_null());
/// ```
#[no_mangle]
#[allow(clippy::not_unsafe_ptr_arg_deref)]
pub extern "C" fn create_mirror(config_json: *const c_char) -> *mut MirrorState {
    let json = match c_ptr_to_str(config_json) {
        Some(json) => json,
        None => {
            warn!("Null or invalid config pointer passed to create_mirror");
            return std::ptr::null_mut();
        }
    };

    let config = match MirrorConfig::from_json(json) {
        Ok(config) => config,
        Err(e) => {
            warn!("❌ Invalid mirror config: {e}");
            return std::ptr::null_mut();
        }
    };

    match MirrorState::open(&config) {
        Ok(state) => {
            info!("✅ Mirror '{}' opened", config.database_name());
            Box::into_raw(Box::new(state))
        }
        Err(e) => {
            warn!("❌ Failed to open mirror: {e}");
            warn!("Attempted storage root: {}", config.storage_root.display());
            std::ptr::null_mut()
        }
    }
}

/// Applies one backend message (`{"type":"push",...}` or
/// `{"type":"response",...}`).
#[no_mangle]
#[allow(clippy::not_unsafe_ptr_arg_deref)]
pub extern "C" fn receive_message(state: *mut MirrorState, json_ptr: *const c_char) -> *const c_char {
    let state = match state_ref(state, "receive_message") {
        Ok(state) => state,
        Err(err) => return err,
    };

    let json = match c_ptr_to_string(json_ptr, "message") {
        Ok(json) => json,
        Err(err) => return err,
    };

    match state.mirror.receive_json(&json) {
        Ok(()) => response_to_c_string(&AppResponse::success("Message applied")),
        Err(e) => response_to_c_string(&e),
    }
}

/// Queues `{"collection", "method", "data"}` for the backend and returns the
/// assigned request id.
#[no_mangle]
#[allow(clippy::not_unsafe_ptr_arg_deref)]
pub extern "C" fn send_request(state: *mut MirrorState, json_ptr: *const c_char) -> *const c_char {
    let state = match state_ref(state, "send_request") {
        Ok(state) => state,
        Err(err) => return err,
    };

    let json = match c_ptr_to_string(json_ptr, "request") {
        Ok(json) => json,
        Err(err) => return err,
    };

    let request: OutgoingRequest = match serde_json::from_str(&json) {
        Ok(request) => request,
        Err(e) => return response_to_c_string(&AppResponse::from(e)),
    };

    let handle = state
        .mirror
        .dispatcher()
        .request(&request.collection, &request.method, request.data);

    response_to_c_string(&AppResponse::Ok(handle.id().to_string()))
}

/// Returns every queued request as a JSON array and empties the queue.
#[no_mangle]
#[allow(clippy::not_unsafe_ptr_arg_deref)]
pub extern "C" fn drain_requests(state: *mut MirrorState) -> *const c_char {
    let state = match state_ref(state, "drain_requests") {
        Ok(state) => state,
        Err(err) => return err,
    };

    json_response(&state.outbox.drain())
}

/// Returns every document of a collection as a JSON array.
#[no_mangle]
#[allow(clippy::not_unsafe_ptr_arg_deref)]
pub extern "C" fn get_all(state: *mut MirrorState, collection: *const c_char) -> *const c_char {
    let state = match state_ref(state, "get_all") {
        Ok(state) => state,
        Err(err) => return err,
    };

    let name = match c_ptr_to_string(collection, "collection") {
        Ok(name) => name,
        Err(err) => return err,
    };

    match state.mirror.database().require(&name) {
        Ok(collection) => json_response(&collection.find_all()),
        Err(e) => response_to_c_string(&e),
    }
}

#[no_mangle]
#[allow(clippy::not_unsafe_ptr_arg_deref)]
pub extern "C" fn get_by_id(
    state: *mut MirrorState,
    collection: *const c_char,
    id: *const c_char,
) -> *const c_char {
    let state = match state_ref(state, "get_by_id") {
        Ok(state) => state,
        Err(err) => return err,
    };

    let name = match c_ptr_to_string(collection, "collection") {
        Ok(name) => name,
        Err(err) => return err,
    };

    let id = match c_ptr_to_string(id, "id") {
        Ok(id) => id,
        Err(err) => return err,
    };

    let collection = match state.mirror.database().require(&name) {
        Ok(collection) => collection,
        Err(e) => return response_to_c_string(&e),
    };

    match collection.get(&id) {
        Some(document) => json_response(&document),
        None => response_to_c_string(&AppResponse::NotFound(format!(
            "No document '{id}' in '{name}'"
        ))),
    }
}

/// Returns documents whose `field` equals the JSON-encoded `value_json`.
#[no_mangle]
#[allow(clippy::not_unsafe_ptr_arg_deref)]
pub extern "C" fn find_by(
    state: *mut MirrorState,
    collection: *const c_char,
    field: *const c_char,
    value_json: *const c_char,
) -> *const c_char {
    let state = match state_ref(state, "find_by") {
        Ok(state) => state,
        Err(err) => return err,
    };

    let name = match c_ptr_to_string(collection, "collection") {
        Ok(name) => name,
        Err(err) => return err,
    };

    let field = match c_ptr_to_string(field, "field") {
        Ok(field) => field,
        Err(err) => return err,
    };

    let value: JsonValue = match c_ptr_to_string(value_json, "value")
        .map(|json| serde_json::from_str(&json))
    {
        Ok(Ok(value)) => value,
        Ok(Err(e)) => return response_to_c_string(&AppResponse::from(e)),
        Err(err) => return err,
    };

    match state.mirror.database().require(&name) {
        Ok(collection) => json_response(&collection.find_by(&field, &value)),
        Err(e) => response_to_c_string(&e),
    }
}

#[no_mangle]
#[allow(clippy::not_unsafe_ptr_arg_deref)]
pub extern "C" fn get_settings(state: *mut MirrorState) -> *const c_char {
    match state_ref(state, "get_settings") {
        Ok(state) => json_response(&state.mirror.settings().snapshot()),
        Err(err) => err,
    }
}

#[no_mangle]
#[allow(clippy::not_unsafe_ptr_arg_deref)]
pub extern "C" fn get_user(state: *mut MirrorState) -> *const c_char {
    match state_ref(state, "get_user") {
        Ok(state) => json_response(&state.mirror.user().snapshot()),
        Err(err) => err,
    }
}

/// Page-unload teardown: clears transient collections and flushes storage.
#[no_mangle]
#[allow(clippy::not_unsafe_ptr_arg_deref)]
pub extern "C" fn unload_mirror(state: *mut MirrorState) -> *const c_char {
    let state = match state_ref(state, "unload_mirror") {
        Ok(state) => state,
        Err(err) => return err,
    };

    match state.mirror.unload() {
        Ok(()) => response_to_c_string(&AppResponse::success("Mirror unloaded")),
        Err(e) => response_to_c_string(&e),
    }
}

/// Closes the mirror and frees the state. The pointer must not be used
/// afterwards.
#[no_mangle]
#[allow(clippy::not_unsafe_ptr_arg_deref)]
pub extern "C" fn close_mirror(state: *mut MirrorState) -> *const c_char {
    if state.is_null() {
        let error = AppResponse::BadRequest("Null state pointer passed to close_mirror".to_string());
        return response_to_c_string(&error);
    }

    let state = unsafe { Box::from_raw(state) };

    match state.mirror.close() {
        Ok(()) => response_to_c_string(&AppResponse::success("Mirror closed successfully")),
        Err(e) => response_to_c_string(&e),
    }
}

/// Closes the mirror, deletes its local database and frees the state. The
/// pointer must not be used afterwards.
#[no_mangle]
#[allow(clippy::not_unsafe_ptr_arg_deref)]
pub extern "C" fn reset_mirror(state: *mut MirrorState) -> *const c_char {
    if state.is_null() {
        let error = AppResponse::BadRequest("Null state pointer passed to reset_mirror".to_string());
        return response_to_c_string(&error);
    }

    let state = unsafe { Box::from_raw(state) };

    match state.mirror.reset() {
        Ok(()) => response_to_c_string(&AppResponse::success("Local data deleted")),
        Err(e) => response_to_c_string(&AppResponse::DatabaseError(format!(
            "Error resetting mirror: {e}"
        ))),
    }
}

/// Frees a string returned by any function in this module.
#[no_mangle]
#[allow(clippy::not_unsafe_ptr_arg_deref)]
pub extern "C" fn free_response(ptr: *const c_char) {
    if ptr.is_null() {
        return;
    }
    drop(unsafe { CString::from_raw(ptr as *mut c_char) });
}

fn state_ref<'a>(state: *mut MirrorState, caller: &str) -> Result<&'a MirrorState, *const c_char> {
    match unsafe { state.as_ref() } {
        Some(state) => Ok(state),
        None => {
            let error = AppResponse::BadRequest(format!("Null state pointer passed to {caller}"));
            Err(response_to_c_string(&error))
        }
    }
}

fn json_response<T: serde::Serialize>(value: &T) -> *const c_char {
    match serde_json::to_string(value) {
        Ok(json) => response_to_c_string(&AppResponse::Ok(json)),
        Err(e) => response_to_c_string(&AppResponse::SerializationError(format!(
            "Error serializing result: {e}"
        ))),
    }
}

/// Serializes an [`AppResponse`] into a C string owned by the caller.
///
/// Returns null if serialization or C string creation fails.
fn response_to_c_string(response: &AppResponse) -> *const c_char {
    let json = match serde_json::to_string(response) {
        Ok(j) => j,
        Err(e) => {
            warn!("Error serializing response: {e}");
            return std::ptr::null();
        }
    };

    match CString::new(json) {
        Ok(c_str) => c_str.into_raw(),
        Err(e) => {
            warn!("Error creating CString: {e}");
            std::ptr::null()
        }
    }
}

fn c_ptr_to_str<'a>(ptr: *const c_char) -> Option<&'a str> {
    if ptr.is_null() {
        return None;
    }
    unsafe { CStr::from_ptr(ptr).to_str().ok() }
}

/// Converts a C string pointer to a `String`, or to a ready-made error
/// response naming `field_name`.
fn c_ptr_to_string(ptr: *const c_char, field_name: &str) -> Result<String, *const c_char> {
    if ptr.is_null() {
        let error = AppResponse::BadRequest(format!("Null {field_name} pointer"));
        return Err(response_to_c_string(&error));
    }

    match unsafe { CStr::from_ptr(ptr).to_str() } {
        Ok(s) => Ok(s.to_string()),
        Err(e) => {
            let error = AppResponse::BadRequest(format!("Invalid UTF-8 in {field_name}: {e}"));
            Err(response_to_c_string(&error))
        }
    }
}
