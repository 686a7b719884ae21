//! Single-flight guard for batch sessions.

use std::sync::Mutex;
use tracing::debug;

use crate::error::{EngineError, Result};

/// Holds the id of the one session allowed to run.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    active: Mutex<Option<String>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim the active slot for `id`; fails if another session holds it.
    pub fn try_acquire(&self, id: &str) -> Result<()> {
        let mut active = self.active.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(current) = active.as_ref() {
            return Err(EngineError::Conflict(format!(
                "batch session {} is already active",
                current
            )));
        }
        *active = Some(id.to_string());
        debug!(session_id = %id, "Session slot acquired");
        Ok(())
    }

    /// Free the slot if `id` holds it. Returns whether anything was released.
    pub fn release(&self, id: &str) -> bool {
        let mut active = self.active.lock().unwrap_or_else(|e| e.into_inner());
        if active.as_deref() == Some(id) {
            *active = None;
            debug!(session_id = %id, "Session slot released");
            true
        } else {
            false
        }
    }

    pub fn active(&self) -> Option<String> {
        self.active.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}
