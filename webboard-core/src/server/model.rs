use std::{
    collections::{BTreeMap, BTreeSet},
    sync::Arc,
};

use crate::{
    context::{ContextId, ContextModel, ContextPath, LogicalContext},
    element::{ElementId, ElementKind, ElementModel},
    resolver::ArbitrationPolicy,
    ValidationError,
};

use super::batch::Change;

/// An element and the physical contexts it is currently enabled in.
#[derive(Debug, Clone)]
pub struct ElementState {
    pub(crate) model: Arc<ElementModel>,
    pub(crate) enabled_in: BTreeSet<ContextPath>,
}

impl ElementState {
    pub fn model(&self) -> &Arc<ElementModel> {
        &self.model
    }

    pub fn enabled_in(&self) -> &BTreeSet<ContextPath> {
        &self.enabled_in
    }
}

/// Everything the batch engine owns: contexts, elements and their arbitration state.
///
/// A batch is applied to a clone of the model; the clone replaces the original only once the
/// engine accepted the batch.
#[derive(Debug, Clone)]
pub struct ServerModel {
    policy: ArbitrationPolicy,
    default_context: ContextId,
    contexts: ContextModel,
    elements: BTreeMap<ElementId, ElementState>,
    /// Last known path of each unbound logical context some element still targets.
    withdrawn: BTreeMap<ContextId, ContextPath>,
}

impl ServerModel {
    pub fn new(policy: ArbitrationPolicy, default_context: ContextId) -> Self {
        Self {
            policy,
            default_context,
            contexts: ContextModel::default(),
            elements: BTreeMap::new(),
            withdrawn: BTreeMap::new(),
        }
    }

    pub fn policy(&self) -> ArbitrationPolicy {
        self.policy
    }

    pub fn default_context(&self) -> &ContextId {
        &self.default_context
    }

    pub fn contexts(&self) -> &ContextModel {
        &self.contexts
    }

    pub fn element(&self, id: ElementId) -> Option<&ElementState> {
        self.elements.get(&id)
    }

    pub fn elements(&self) -> impl Iterator<Item = &ElementState> {
        self.elements.values()
    }

    pub(crate) fn element_mut(&mut self, id: ElementId) -> Option<&mut ElementState> {
        self.elements.get_mut(&id)
    }

    /// Physical contexts `element` maps to. Elements without targets map to the default
    /// context. A target that was unbound keeps its path for as long as another logical
    /// context still serves it; otherwise it is skipped.
    pub fn physical_contexts_of(&self, element: &ElementModel) -> Vec<ContextPath> {
        let mut paths = BTreeSet::new();
        if element.target_contexts().is_empty() {
            if let Some(context) = self.contexts.logical_context(&self.default_context) {
                paths.insert(context.path().clone());
            }
        } else {
            for target in element.target_contexts() {
                if let Some(path) = self.target_path(target) {
                    paths.insert(path.clone());
                }
            }
        }
        paths.into_iter().collect()
    }

    fn target_path(&self, target: &ContextId) -> Option<&ContextPath> {
        match self.contexts.logical_context(target) {
            Some(context) => Some(context.path()),
            None => self.withdrawn.get(target).filter(|path| {
                self.contexts
                    .highest_priority_logical_context(path)
                    .is_some()
            }),
        }
    }

    /// The logical context `element` is served under in `physical`.
    pub fn context_for(
        &self,
        element: &ElementModel,
        physical: &ContextPath,
    ) -> Option<&LogicalContext> {
        if element.target_contexts().is_empty() {
            return match self.contexts.logical_context(&self.default_context) {
                Some(context) if context.path() == physical => Some(context),
                _ => self.contexts.highest_priority_logical_context(physical),
            };
        }
        let bound = element
            .target_contexts()
            .iter()
            .filter_map(|id| self.contexts.logical_context(id))
            .filter(|context| context.path() == physical)
            .min_by_key(|context| context.priority());
        if bound.is_some() {
            return bound;
        }
        let withdrawn_here = element
            .target_contexts()
            .iter()
            .any(|id| self.withdrawn.get(id) == Some(physical));
        if withdrawn_here {
            self.contexts.highest_priority_logical_context(physical)
        } else {
            None
        }
    }

    /// Enabled filters of a physical context in chain order.
    pub fn enabled_filters(&self, physical: &ContextPath) -> Vec<Arc<ElementModel>> {
        let mut filters: Vec<Arc<ElementModel>> = self
            .elements
            .values()
            .filter(|state| {
                state.model.kind() == ElementKind::Filter && state.enabled_in.contains(physical)
            })
            .map(|state| state.model.clone())
            .collect();
        filters.sort_by_key(|f| f.tie_break_key());
        filters
    }

    /// Validates `change` against the current state and applies it.
    pub(crate) fn apply(&mut self, change: &Change) -> Result<(), ValidationError> {
        match change {
            Change::AddPhysicalContext(path) => {
                self.contexts.add_physical_context(path);
            }
            Change::RemovePhysicalContext(path) => {
                self.contexts.remove_physical_context(path)?;
            }
            Change::AddLogicalContext(context) => {
                self.contexts.bind_logical_context(context.clone())?;
                self.withdrawn.remove(context.id());
            }
            Change::RemoveLogicalContext(id) => {
                let context = self.contexts.unbind_logical_context(id)?;
                if self.is_targeted(id) {
                    self.withdrawn.insert(id.clone(), context.path().clone());
                }
            }
            Change::UpdateContextRank { context, rank } => {
                self.contexts.update_rank(context, *rank)?;
            }
            Change::AddElement(element) => {
                if self.elements.contains_key(&element.id()) {
                    return Err(ValidationError::DuplicateElement(element.id()));
                }
                self.check_targets(element.target_contexts())?;
                self.elements.insert(
                    element.id(),
                    ElementState {
                        model: element.clone(),
                        enabled_in: BTreeSet::new(),
                    },
                );
            }
            Change::RemoveElement(id) => {
                self.elements
                    .remove(id)
                    .ok_or(ValidationError::UnknownElement(*id))?;
                self.prune_withdrawn();
            }
            Change::RetargetElement { element, targets } => {
                self.check_targets(targets)?;
                let state = self
                    .elements
                    .get_mut(element)
                    .ok_or(ValidationError::UnknownElement(*element))?;
                state.model = Arc::new(state.model.with_targets(targets.clone()));
                self.prune_withdrawn();
            }
            Change::RefreshFilters(path) => {
                if self.contexts.physical_context(path).is_none() {
                    return Err(ValidationError::UnknownPhysicalContext(path.to_string()));
                }
            }
        }
        Ok(())
    }

    fn is_targeted(&self, id: &ContextId) -> bool {
        self.elements
            .values()
            .any(|state| state.model.target_contexts().contains(id))
    }

    fn prune_withdrawn(&mut self) {
        let withdrawn = std::mem::take(&mut self.withdrawn);
        self.withdrawn = withdrawn
            .into_iter()
            .filter(|(id, _)| self.is_targeted(id))
            .collect();
    }

    fn check_targets(&self, targets: &[ContextId]) -> Result<(), ValidationError> {
        match targets
            .iter()
            .find(|id| self.contexts.logical_context(id).is_none())
        {
            Some(missing) => Err(ValidationError::UnknownContext(missing.clone())),
            None => Ok(()),
        }
    }
}
