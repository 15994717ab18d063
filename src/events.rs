//! Named-event publish/subscribe.
//!
//! An [`EventBus`] is created with the fixed set of event names its owner may
//! use. Binding or emitting any other name fails immediately with
//! [`AppResponse::UnknownEvent`]. Owners embed a bus and implement
//! [`Emitter`] to expose `on`/`off`/`emit` as their own methods.
//!
//! Emission is synchronous. Each pass runs over a snapshot of the listener
//! list taken when the pass starts, so listeners may bind or unbind (even
//! themselves) while being called without affecting the pass in progress.
//!
//! ```rust
//! use std::cell::Cell;
//! use std::rc::Rc;
//! use virtool_mirror_core::events::{EventBus, Listener};
//!
//! let bus: EventBus<u32> = EventBus::new(["change"]);
//! let seen = Rc::new(Cell::new(0));
//! let sink = seen.clone();
//! let listener: Listener<u32> = Rc::new(move |value: &u32| sink.set(*value));
//!
//! bus.on("change", listener.clone())?;
//! bus.emit("change", &7)?;
//! assert_eq!(seen.get(), 7);
//!
//! assert!(bus.on("missing", listener).is_err());
//! # Ok::<(), virtool_mirror_core::app_response::AppResponse>(())
//! ```

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::Rc;

use crate::app_response::AppResponse;

/// A registered callback. Identity is the `Rc` allocation, which is what
/// [`EventBus::off`] matches against.
pub type Listener<P> = Rc<dyn Fn(&P)>;

pub struct EventBus<P> {
    listeners: RefCell<BTreeMap<String, Vec<Listener<P>>>>,
}

impl<P> EventBus<P> {
    pub fn new<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let listeners = names
            .into_iter()
            .map(|name| (name.into(), Vec::new()))
            .collect();

        Self {
            listeners: RefCell::new(listeners),
        }
    }

    pub fn is_declared(&self, name: &str) -> bool {
        self.listeners.borrow().contains_key(name)
    }

    pub fn declared(&self) -> Vec<String> {
        self.listeners.borrow().keys().cloned().collect()
    }

    pub fn listener_count(&self, name: &str) -> usize {
        self.listeners.borrow().get(name).map_or(0, Vec::len)
    }

    pub fn on(&self, name: &str, listener: Listener<P>) -> Result<(), AppResponse> {
        let mut listeners = self.listeners.borrow_mut();
        match listeners.get_mut(name) {
            Some(registered) => {
                registered.push(listener);
                Ok(())
            }
            None => Err(AppResponse::UnknownEvent(name.to_string())),
        }
    }

    /// Removes the first registration of `listener` for `name`. Unbinding a
    /// listener that was never bound is a no-op.
    pub fn off(&self, name: &str, listener: &Listener<P>) -> Result<(), AppResponse> {
        let mut listeners = self.listeners.borrow_mut();
        let registered = listeners
            .get_mut(name)
            .ok_or_else(|| AppResponse::UnknownEvent(name.to_string()))?;

        if let Some(position) = registered.iter().position(|l| Rc::ptr_eq(l, listener)) {
            registered.remove(position);
        }

        Ok(())
    }

    pub fn emit(&self, name: &str, data: &P) -> Result<(), AppResponse> {
        self.emit_all(&[name], data)
    }

    /// Emits `data` under each name in turn. Every name is checked before any
    /// listener runs, so an undeclared name means nothing is delivered.
    pub fn emit_all(&self, names: &[&str], data: &P) -> Result<(), AppResponse> {
        let snapshots = {
            let listeners = self.listeners.borrow();
            names
                .iter()
                .map(|name| {
                    listeners
                        .get(*name)
                        .cloned()
                        .ok_or_else(|| AppResponse::UnknownEvent(name.to_string()))
                })
                .collect::<Result<Vec<_>, _>>()?
        };

        for snapshot in snapshots {
            for listener in snapshot {
                listener(data);
            }
        }

        Ok(())
    }
}

/// Grants an owner the bus methods of the [`EventBus`] it embeds.
pub trait Emitter {
    type Payload;

    fn events(&self) -> &EventBus<Self::Payload>;

    fn on(&self, name: &str, listener: Listener<Self::Payload>) -> Result<(), AppResponse> {
        self.events().on(name, listener)
    }

    fn off(&self, name: &str, listener: &Listener<Self::Payload>) -> Result<(), AppResponse> {
        self.events().off(name, listener)
    }

    fn emit(&self, name: &str, data: &Self::Payload) -> Result<(), AppResponse> {
        self.events().emit(name, data)
    }
}
