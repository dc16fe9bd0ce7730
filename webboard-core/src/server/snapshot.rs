use serde::Serialize;

use super::model::ServerModel;
use crate::{
    context::{ContextId, ContextPath, ModuleHandle},
    element::{ElementId, ElementKind},
    resolver::ArbitrationPolicy,
    util::hash::fingerprint,
};

/// A serializable picture of the model, fingerprinted for cheap comparison.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ModelSnapshot {
    pub policy: ArbitrationPolicy,
    pub default_context: ContextId,
    pub physical_contexts: Vec<PhysicalSnapshot>,
    pub logical_contexts: Vec<LogicalSnapshot>,
    pub elements: Vec<ElementSnapshot>,
    /// SHA-256 over everything above.
    pub fingerprint: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PhysicalSnapshot {
    pub path: ContextPath,
    pub pinned: bool,
    /// Bound logical contexts, highest priority first.
    pub contexts: Vec<ContextId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LogicalSnapshot {
    pub id: ContextId,
    pub path: ContextPath,
    pub rank: i32,
    pub order: u64,
    pub owner: Option<ModuleHandle>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ElementSnapshot {
    pub id: ElementId,
    pub kind: ElementKind,
    pub name: String,
    pub patterns: Vec<String>,
    pub targets: Vec<ContextId>,
    pub rank: i32,
    pub service_id: u64,
    pub dynamic: bool,
    pub owner: Option<ModuleHandle>,
    pub enabled_in: Vec<ContextPath>,
    /// Mapped physical contexts the element lost arbitration in.
    pub shadowed_in: Vec<ContextPath>,
}

impl ModelSnapshot {
    pub(crate) fn capture(model: &ServerModel) -> Self {
        let physical_contexts = model
            .contexts()
            .physical_contexts()
            .map(|p| PhysicalSnapshot {
                path: p.path().clone(),
                pinned: p.is_pinned(),
                contexts: p.bound().to_vec(),
            })
            .collect();
        let logical_contexts = model
            .contexts()
            .logical_contexts()
            .map(|c| LogicalSnapshot {
                id: c.id().clone(),
                path: c.path().clone(),
                rank: c.rank(),
                order: c.order(),
                owner: c.owner().cloned(),
            })
            .collect();
        let elements = model
            .elements()
            .map(|state| {
                let element = state.model();
                let physical = model.physical_contexts_of(element);
                ElementSnapshot {
                    id: element.id(),
                    kind: element.kind(),
                    name: element.name().to_string(),
                    patterns: element.patterns().to_strings(),
                    targets: element.target_contexts().to_vec(),
                    rank: element.rank(),
                    service_id: element.service_id(),
                    dynamic: element.is_dynamic(),
                    owner: element.owner().cloned(),
                    enabled_in: state.enabled_in().iter().cloned().collect(),
                    shadowed_in: physical
                        .into_iter()
                        .filter(|p| !state.enabled_in().contains(p))
                        .collect(),
                }
            })
            .collect();

        let mut snapshot = Self {
            policy: model.policy(),
            default_context: model.default_context().clone(),
            physical_contexts,
            logical_contexts,
            elements,
            fingerprint: String::new(),
        };
        snapshot.fingerprint =
            fingerprint(&snapshot).expect("snapshots hold only string-keyed plain data");
        snapshot
    }

    pub fn element(&self, id: ElementId) -> Option<&ElementSnapshot> {
        self.elements.iter().find(|e| e.id == id)
    }
}
