//! Process-wide one-time setup.
//!
//! Component types are registered exactly once per process, before any
//! session starts, through [`init_once`]. Sessions read the resulting
//! registry; nothing is initialised lazily.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use log::debug;

use crate::component::{Component, ComponentRegistry};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum InitError {
    #[error("runtime already initialised")]
    AlreadyInitialized,
}

/// Everything registered at process start.
#[derive(Debug, Default)]
pub struct RuntimeSetup {
    components: ComponentRegistry,
}

impl RuntimeSetup {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn component<T: Component>(mut self) -> Self {
        self.components.register::<T>();
        self
    }

    pub fn components(&self) -> &ComponentRegistry {
        &self.components
    }
}

static INITIALIZED: AtomicBool = AtomicBool::new(false);
static COMPONENTS: Mutex<Option<Arc<ComponentRegistry>>> = Mutex::new(None);

/// Install `setup` for the rest of the process. Only the first call
/// succeeds.
pub fn init_once(setup: RuntimeSetup) -> Result<(), InitError> {
    let mut slot = COMPONENTS.lock().unwrap_or_else(|e| e.into_inner());
    if INITIALIZED.load(Ordering::Acquire) {
        return Err(InitError::AlreadyInitialized);
    }
    debug!("runtime initialised with {} component types", setup.components.len());
    *slot = Some(Arc::new(setup.components));
    INITIALIZED.store(true, Ordering::Release);
    Ok(())
}

pub fn is_initialized() -> bool {
    INITIALIZED.load(Ordering::Acquire)
}

/// The registered component types, if [`init_once`] has run.
pub fn components() -> Option<Arc<ComponentRegistry>> {
    if !is_initialized() {
        return None;
    }
    COMPONENTS
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .as_ref()
        .map(Arc::clone)
}
