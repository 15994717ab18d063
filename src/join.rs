//! Completion join for a fixed set of independent tasks.
//!
//! A [`CompletionJoin`] is created with the keys it waits for and a callback.
//! Each task reports through [`CompletionJoin::complete`]; the callback runs
//! exactly once, with every collected value, as soon as the last expected key
//! arrives. An empty key set completes on construction.

use std::collections::{BTreeMap, BTreeSet};

use crate::app_response::AppResponse;

pub struct CompletionJoin<T, F>
where
    F: FnOnce(BTreeMap<String, T>),
{
    outstanding: BTreeSet<String>,
    completed: BTreeMap<String, T>,
    on_complete: Option<F>,
}

impl<T, F> CompletionJoin<T, F>
where
    F: FnOnce(BTreeMap<String, T>),
{
    pub fn new<I, S>(keys: I, on_complete: F) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut join = Self {
            outstanding: keys.into_iter().map(Into::into).collect(),
            completed: BTreeMap::new(),
            on_complete: Some(on_complete),
        };
        join.fire_if_ready();
        join
    }

    /// Records the result for `key`. Returns `true` when this call finished
    /// the join. Keys that were never expected, or that already completed,
    /// are rejected without touching the collected results.
    pub fn complete(&mut self, key: &str, value: T) -> Result<bool, AppResponse> {
        if !self.outstanding.remove(key) {
            let reason = if self.completed.contains_key(key) {
                format!("'{key}' already completed")
            } else {
                format!("'{key}' is not part of this join")
            };
            return Err(AppResponse::ValidationError(reason));
        }

        self.completed.insert(key.to_string(), value);
        Ok(self.fire_if_ready())
    }

    pub fn remaining(&self) -> usize {
        self.outstanding.len()
    }

    pub fn is_done(&self) -> bool {
        self.on_complete.is_none()
    }

    fn fire_if_ready(&mut self) -> bool {
        if !self.outstanding.is_empty() {
            return false;
        }

        match self.on_complete.take() {
            Some(callback) => {
                callback(std::mem::take(&mut self.completed));
                true
            }
            None => false,
        }
    }
}
