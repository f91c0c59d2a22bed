use std::{
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, PoisonError, RwLock,
    },
};

use serde::Serialize;

use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PipelineState {
    Unloaded,
    Loading,
    Loaded,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PipelineStatus {
    pub state: PipelineState,
    pub loaded: bool,
    pub artifacts_present: bool,
    pub missing: Vec<PathBuf>,
}

impl PipelineStatus {
    pub fn new(state: PipelineState, missing: Vec<PathBuf>) -> Self {
        Self {
            state,
            loaded: state == PipelineState::Loaded,
            artifacts_present: missing.is_empty(),
            missing,
        }
    }
}

/// Clears the loading flag however the constructor exits.
struct LoadingGuard<'a>(&'a AtomicBool);

impl<'a> LoadingGuard<'a> {
    fn enter(flag: &'a AtomicBool) -> Self {
        flag.store(true, Ordering::SeqCst);
        Self(flag)
    }
}

impl Drop for LoadingGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Holds a lazily built model set.
///
/// Load and unload are serialized by `transition`. Readers only take the
/// `RwLock` long enough to clone the `Arc`, so in-flight calls keep their
/// models alive across an unload.
pub struct ModelSlot<M> {
    models: RwLock<Option<Arc<M>>>,
    transition: Mutex<()>,
    loading: AtomicBool,
}

impl<M> Default for ModelSlot<M> {
    fn default() -> Self {
        Self {
            models: RwLock::new(None),
            transition: Mutex::new(()),
            loading: AtomicBool::new(false),
        }
    }
}

impl<M> ModelSlot<M> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self) -> Option<Arc<M>> {
        self.models
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn is_loaded(&self) -> bool {
        self.get().is_some()
    }

    pub fn state(&self) -> PipelineState {
        if self.loading.load(Ordering::SeqCst) {
            PipelineState::Loading
        } else if self.is_loaded() {
            PipelineState::Loaded
        } else {
            PipelineState::Unloaded
        }
    }

    /// Runs `build` unless models are already present. A failed build leaves the slot empty.
    pub fn load_with<F>(&self, build: F) -> Result<Arc<M>>
    where
        F: FnOnce() -> Result<M>,
    {
        let _transition = self
            .transition
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(models) = self.get() {
            return Ok(models);
        }
        let models = {
            let _loading = LoadingGuard::enter(&self.loading);
            Arc::new(build()?)
        };
        *self.models.write().unwrap_or_else(PoisonError::into_inner) = Some(models.clone());
        Ok(models)
    }

    /// Drops the slot's handle. Returns whether anything was loaded.
    pub fn unload(&self) -> bool {
        let _transition = self
            .transition
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        self.models
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::PipelineError;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn load_is_idempotent() {
        let slot = ModelSlot::<u32>::new();
        let builds = AtomicUsize::new(0);
        for _ in 0..3 {
            let m = slot
                .load_with(|| {
                    builds.fetch_add(1, Ordering::SeqCst);
                    Ok(7)
                })
                .unwrap();
            assert_eq!(*m, 7);
        }
        assert_eq!(builds.load(Ordering::SeqCst), 1);
        assert_eq!(slot.state(), PipelineState::Loaded);
    }

    #[test]
    fn unload_never_loaded() {
        let slot = ModelSlot::<u32>::new();
        assert!(!slot.unload());
        assert!(!slot.unload());
        assert_eq!(slot.state(), PipelineState::Unloaded);
    }

    #[test]
    fn failed_load_stays_unloaded() {
        let slot = ModelSlot::<u32>::new();
        let err = slot
            .load_with(|| Err(PipelineError::LoadFailed { failures: vec!["det".into()] }))
            .unwrap_err();
        assert!(matches!(err, PipelineError::LoadFailed { .. }));
        assert_eq!(slot.state(), PipelineState::Unloaded);
        assert!(slot.load_with(|| Ok(1)).is_ok());
    }

    #[test]
    fn in_flight_handles_survive_unload() {
        let slot = ModelSlot::<String>::new();
        let held = slot.load_with(|| Ok("models".to_owned())).unwrap();
        assert!(slot.unload());
        assert!(!slot.is_loaded());
        assert_eq!(held.as_str(), "models");
    }

    #[test]
    fn status_flags() {
        let status = PipelineStatus::new(PipelineState::Unloaded, vec![PathBuf::from("x.onnx")]);
        assert!(!status.loaded);
        assert!(!status.artifacts_present);
        let status = PipelineStatus::new(PipelineState::Loaded, vec![]);
        assert!(status.loaded && status.artifacts_present);
    }
}
