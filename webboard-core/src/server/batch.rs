use std::{
    collections::{BTreeMap, BTreeSet},
    fmt,
    sync::Arc,
};

use tracing::{debug, warn};

use super::model::ServerModel;
use crate::{
    context::{ContextId, ContextPath, LogicalContext},
    element::{ElementId, ElementKind, ElementModel},
    engine::Effect,
    resolver::{conflict_keys, ConflictKey, Resolver},
    ValidationError,
};

/// One structural operation of a batch.
#[derive(Debug, Clone)]
pub enum Change {
    /// Creates a physical context that stays until explicitly removed.
    AddPhysicalContext(ContextPath),
    /// Fails while a logical context is still bound to it.
    RemovePhysicalContext(ContextPath),
    AddLogicalContext(LogicalContext),
    RemoveLogicalContext(ContextId),
    UpdateContextRank { context: ContextId, rank: i32 },
    AddElement(Arc<ElementModel>),
    RemoveElement(ElementId),
    RetargetElement {
        element: ElementId,
        targets: Vec<ContextId>,
    },
    /// Re-sends the filter list of a physical context to the engine.
    RefreshFilters(ContextPath),
}

impl Change {
    pub fn add_element(element: ElementModel) -> Self {
        Change::AddElement(Arc::new(element))
    }

    pub fn add_physical_context(path: &str) -> Result<Self, ValidationError> {
        Ok(Change::AddPhysicalContext(ContextPath::parse(path)?))
    }
}

impl fmt::Display for Change {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Change::AddPhysicalContext(path) => write!(f, "add physical context {path}"),
            Change::RemovePhysicalContext(path) => write!(f, "remove physical context {path}"),
            Change::AddLogicalContext(context) => {
                write!(f, "add logical context {} at {}", context.id(), context.path())
            }
            Change::RemoveLogicalContext(id) => write!(f, "remove logical context {id}"),
            Change::UpdateContextRank { context, rank } => {
                write!(f, "set rank of {context} to {rank}")
            }
            Change::AddElement(element) => write!(f, "add {element}"),
            Change::RemoveElement(id) => write!(f, "remove element {id}"),
            Change::RetargetElement { element, targets } => {
                write!(f, "retarget element {element} to {targets:?}")
            }
            Change::RefreshFilters(path) => write!(f, "refresh filters of {path}"),
        }
    }
}

/// A labelled list of changes applied as one unit, in the order they were added.
#[derive(Debug, Clone)]
pub struct Batch {
    label: String,
    changes: Vec<Change>,
}

impl Batch {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            changes: Vec::new(),
        }
    }

    pub fn add(&mut self, change: Change) -> &mut Self {
        self.changes.push(change);
        self
    }

    pub fn with(mut self, change: Change) -> Self {
        self.changes.push(change);
        self
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn changes(&self) -> &[Change] {
        &self.changes
    }

    pub fn len(&self) -> usize {
        self.changes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }
}

/// What a committed batch did.
#[derive(Debug, Clone)]
pub struct BatchReport {
    pub label: String,
    pub effects: Vec<Effect>,
    /// Slots walked while re-arbitrating.
    pub iterations: usize,
}

/// Re-arbitrates the elements `working` changed relative to `before` and stores the outcome in
/// `working`. Returns the number of slots walked.
pub(crate) fn rearbitrate(before: &ServerModel, working: &mut ServerModel) -> usize {
    let mut seeds: BTreeSet<ConflictKey> = BTreeSet::new();
    let mut unmapped: Vec<ElementId> = Vec::new();

    let ids: BTreeSet<ElementId> = before
        .elements()
        .chain(working.elements())
        .map(|state| state.model().id())
        .collect();
    for id in ids {
        let old = before.element(id).map(|state| {
            let physical = before.physical_contexts_of(state.model());
            (state, physical)
        });
        let new = working.element(id).map(|state| {
            let physical = working.physical_contexts_of(state.model());
            (state, physical)
        });
        let touched = match (&old, &new) {
            (Some((old, old_physical)), Some((new, new_physical))) => {
                !Arc::ptr_eq(old.model(), new.model()) || old_physical != new_physical
            }
            _ => true,
        };
        if !touched {
            continue;
        }
        if let Some((state, physical)) = &old {
            seeds.extend(conflict_keys(state.model(), physical));
        }
        if let Some((state, physical)) = &new {
            seeds.extend(conflict_keys(state.model(), physical));
            if physical.is_empty() {
                unmapped.push(id);
            }
        }
    }

    let (enabled, iterations) = {
        let candidates: Vec<(&ElementModel, Vec<ContextPath>)> = working
            .elements()
            .map(|state| {
                let model: &ElementModel = state.model();
                (model, working.physical_contexts_of(model))
            })
            .collect();
        let resolver = Resolver::new(working.policy(), candidates);
        let resolution = resolver.resolve(seeds);
        for (key, outcome) in &resolution.groups {
            if !outcome.shadowed.is_empty() {
                debug!(%key, enabled = ?outcome.enabled, shadowed = ?outcome.shadowed, "conflict group resolved");
            }
        }
        (resolution.enabled, resolution.iterations)
    };

    for (id, paths) in enabled {
        if let Some(state) = working.element_mut(id) {
            state.enabled_in = paths;
        }
    }
    for id in unmapped {
        if let Some(state) = working.element_mut(id) {
            state.enabled_in.clear();
        }
    }

    for state in working.elements() {
        let physical = working.physical_contexts_of(state.model());
        let shadowed: Vec<&ContextPath> = physical
            .iter()
            .filter(|p| !state.enabled_in().contains(*p))
            .collect();
        let newly = match before.element(state.model().id()) {
            Some(old) => old.enabled_in() != state.enabled_in(),
            None => true,
        };
        if newly && !shadowed.is_empty() {
            warn!(element = %state.model(), ?shadowed, "element is shadowed");
        }
    }
    iterations
}

/// The minimal list of effects that turns `before` into `after`, in apply order.
pub(crate) fn compute_effects(
    before: &ServerModel,
    after: &ServerModel,
    refresh: &BTreeSet<ContextPath>,
) -> Vec<Effect> {
    let mut effects = Vec::new();

    let old_physical: BTreeSet<&ContextPath> =
        before.contexts().physical_contexts().map(|p| p.path()).collect();
    let new_physical: BTreeSet<&ContextPath> =
        after.contexts().physical_contexts().map(|p| p.path()).collect();
    for path in old_physical.difference(&new_physical) {
        effects.push(Effect::DestroyPhysical((*path).clone()));
    }
    for path in new_physical.difference(&old_physical) {
        effects.push(Effect::CreatePhysical((*path).clone()));
    }

    let old_logical: BTreeMap<&ContextId, &LogicalContext> = before
        .contexts()
        .logical_contexts()
        .map(|c| (c.id(), c))
        .collect();
    let new_logical: BTreeMap<&ContextId, &LogicalContext> = after
        .contexts()
        .logical_contexts()
        .map(|c| (c.id(), c))
        .collect();
    for (id, old) in &old_logical {
        let changed = match new_logical.get(id) {
            Some(new) => new.rank() != old.rank() || new.path() != old.path(),
            None => true,
        };
        if changed {
            effects.push(Effect::UnbindContext {
                context: (*id).clone(),
                physical: old.path().clone(),
            });
        }
    }
    for (id, new) in &new_logical {
        let changed = match old_logical.get(id) {
            Some(old) => new.rank() != old.rank() || new.path() != old.path(),
            None => true,
        };
        if changed {
            effects.push(Effect::BindContext((*new).clone()));
        }
    }

    let mut filter_paths: BTreeSet<ContextPath> = refresh.clone();
    let ids: BTreeSet<ElementId> = before
        .elements()
        .chain(after.elements())
        .map(|state| state.model().id())
        .collect();
    let empty = BTreeSet::new();
    for id in ids {
        let old = before.element(id);
        let new = after.element(id);
        let old_enabled = old.map(|s| s.enabled_in()).unwrap_or(&empty);
        let new_enabled = new.map(|s| s.enabled_in()).unwrap_or(&empty);
        let replaced = match (old, new) {
            (Some(old), Some(new)) => !Arc::ptr_eq(old.model(), new.model()),
            _ => false,
        };

        if let Some(old) = old {
            for path in old_enabled {
                if replaced || !new_enabled.contains(path) {
                    effects.push(Effect::Deactivate {
                        element: old.model().clone(),
                        physical: path.clone(),
                        context: before.context_for(old.model(), path).cloned(),
                    });
                    if old.model().kind() == ElementKind::Filter {
                        filter_paths.insert(path.clone());
                    }
                }
            }
        }
        if let Some(new) = new {
            for path in new_enabled {
                if replaced || !old_enabled.contains(path) {
                    effects.push(Effect::Activate {
                        element: new.model().clone(),
                        physical: path.clone(),
                        context: after.context_for(new.model(), path).cloned(),
                    });
                    if new.model().kind() == ElementKind::Filter {
                        filter_paths.insert(path.clone());
                    }
                }
            }
        }
    }

    for path in filter_paths {
        if after.contexts().physical_context(&path).is_some() {
            let filters = after.enabled_filters(&path);
            effects.push(Effect::UpdateFilters {
                physical: path,
                filters,
            });
        }
    }

    effects.sort_by_key(Effect::apply_order);
    effects
}
