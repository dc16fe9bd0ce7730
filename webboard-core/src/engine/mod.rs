//! The contract between the batch engine and a concrete HTTP engine.
//!
//! The batch engine computes the minimal list of [`Effect`]s a batch implies and hands the whole
//! list to [`EngineAdapter::apply_batch_effects`] in one call. An adapter that returns an error
//! must leave its engine as it was before the call; the batch engine then discards the batch.
//! Callbacks into user code wait for [`EngineAdapter::batch_committed`].
use std::{fmt, sync::Arc};

use crate::{
    config::EngineSettings,
    context::{ContextId, ContextPath, LogicalContext},
    element::ElementModel,
    EngineError,
};

/// A structural change for the engine to materialize.
#[derive(Debug, Clone)]
pub enum Effect {
    CreatePhysical(ContextPath),
    DestroyPhysical(ContextPath),
    BindContext(LogicalContext),
    UnbindContext {
        context: ContextId,
        physical: ContextPath,
    },
    /// The element became enabled in `physical`, under `context` when one is bound.
    Activate {
        element: Arc<ElementModel>,
        physical: ContextPath,
        context: Option<LogicalContext>,
    },
    Deactivate {
        element: Arc<ElementModel>,
        physical: ContextPath,
        context: Option<LogicalContext>,
    },
    /// The full list of enabled filters of a physical context, in chain order.
    UpdateFilters {
        physical: ContextPath,
        filters: Vec<Arc<ElementModel>>,
    },
}

impl Effect {
    /// Effects are applied teardown first: deactivations and unbinds before creations, and
    /// filter lists last.
    pub(crate) fn apply_order(&self) -> u8 {
        match self {
            Effect::Deactivate { .. } => 0,
            Effect::UnbindContext { .. } => 1,
            Effect::DestroyPhysical(_) => 2,
            Effect::CreatePhysical(_) => 3,
            Effect::BindContext(_) => 4,
            Effect::Activate { .. } => 5,
            Effect::UpdateFilters { .. } => 6,
        }
    }
}

impl fmt::Display for Effect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Effect::CreatePhysical(path) => write!(f, "create {path}"),
            Effect::DestroyPhysical(path) => write!(f, "destroy {path}"),
            Effect::BindContext(context) => write!(f, "bind {} to {}", context.id(), context.path()),
            Effect::UnbindContext { context, physical } => {
                write!(f, "unbind {context} from {physical}")
            }
            Effect::Activate {
                element, physical, ..
            } => write!(f, "activate {element} in {physical}"),
            Effect::Deactivate {
                element, physical, ..
            } => write!(f, "deactivate {element} in {physical}"),
            Effect::UpdateFilters { physical, filters } => {
                write!(f, "update {} filters of {physical}", filters.len())
            }
        }
    }
}

pub trait EngineAdapter: Send + Sync {
    fn name(&self) -> &str;

    fn configure(&self, settings: &EngineSettings) -> Result<(), EngineError>;

    fn start(&self) -> Result<(), EngineError>;

    fn stop(&self) -> Result<(), EngineError>;

    /// Applies all effects of one batch. Must be atomic for concurrently arriving requests.
    fn apply_batch_effects(&self, effects: &[Effect]) -> Result<(), EngineError>;

    /// Called once the batch whose effects were last applied is committed and the batch lock
    /// is released. User callbacks queued while applying belong here.
    fn batch_committed(&self) {}
}

/// Adapter for a server that only dispatches in-process and has nothing to materialize.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullEngine;

impl EngineAdapter for NullEngine {
    fn name(&self) -> &str {
        "null"
    }

    fn configure(&self, _settings: &EngineSettings) -> Result<(), EngineError> {
        Ok(())
    }

    fn start(&self) -> Result<(), EngineError> {
        Ok(())
    }

    fn stop(&self) -> Result<(), EngineError> {
        Ok(())
    }

    fn apply_batch_effects(&self, _effects: &[Effect]) -> Result<(), EngineError> {
        Ok(())
    }
}
