//! Registration feed.
//!
//! Modules publish contexts and elements as [`RegistrationEvent`]s. The [`Whiteboard`] turns
//! each event into one batch, resolving context selectors against the contexts that exist at
//! that moment. Elements whose selector matches no context wait until one appears.
use std::{
    collections::{BTreeMap, BTreeSet},
    sync::Arc,
};

use parking_lot::Mutex;
use tracing::debug;

use crate::{
    context::{ContextId, LogicalContext, ModuleHandle},
    element::{ElementId, ElementModel},
    server::{Batch, BatchReport, Change, WebServer},
    BatchError,
};

mod direct;

pub use direct::DirectRegistrations;

/// Which logical contexts an element binds to.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ContextSelector {
    /// The server's default context.
    #[default]
    Default,
    /// Every listed context that currently exists.
    Named(Vec<ContextId>),
    /// Every context that currently exists.
    All,
}

impl ContextSelector {
    /// Target list for the given set of existing contexts. `None` means nothing matches yet;
    /// an empty list is the default context.
    fn resolve(&self, contexts: &BTreeSet<ContextId>) -> Option<Vec<ContextId>> {
        let targets: Vec<ContextId> = match self {
            ContextSelector::Default => return Some(Vec::new()),
            ContextSelector::Named(names) => names
                .iter()
                .filter(|name| contexts.contains(*name))
                .cloned()
                .collect(),
            ContextSelector::All => contexts.iter().cloned().collect(),
        };
        (!targets.is_empty()).then_some(targets)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContextChange {
    Rank(i32),
    Removed,
}

#[derive(Debug, Clone)]
pub enum RegistrationEvent {
    RegisterContext(LogicalContext),
    Register {
        element: ElementModel,
        selector: ContextSelector,
    },
    Unregister(ElementId),
    ContextChanged {
        context: ContextId,
        change: ContextChange,
    },
    /// Withdraws every element and context the module owns.
    ModuleStopped(ModuleHandle),
}

#[derive(Debug, Clone)]
struct Tracked {
    element: Arc<ElementModel>,
    selector: ContextSelector,
    /// Targets the element is registered with; `None` while it waits for a context.
    targets: Option<Vec<ContextId>>,
}

#[derive(Debug, Clone, Default)]
struct Tracking {
    elements: BTreeMap<ElementId, Tracked>,
}

pub struct Whiteboard {
    server: Arc<WebServer>,
    tracking: Mutex<Tracking>,
}

impl Whiteboard {
    pub fn new(server: Arc<WebServer>) -> Self {
        Self {
            server,
            tracking: Mutex::new(Tracking::default()),
        }
    }

    pub fn server(&self) -> &Arc<WebServer> {
        &self.server
    }

    /// Elements registered but not bound to any context yet.
    pub fn pending(&self) -> Vec<ElementId> {
        self.tracking
            .lock()
            .elements
            .iter()
            .filter(|(_, tracked)| tracked.targets.is_none())
            .map(|(id, _)| *id)
            .collect()
    }

    /// Applies `event` as one batch. Returns `None` when the event changes nothing the server
    /// sees, like a registration that is still waiting for its contexts.
    pub fn handle(&self, event: RegistrationEvent) -> Result<Option<BatchReport>, BatchError> {
        let mut tracking = self.tracking.lock();
        let mut next = tracking.clone();
        let mut contexts: BTreeSet<ContextId> = self.server.with_model(|model| {
            model
                .contexts()
                .logical_contexts()
                .map(|c| c.id().clone())
                .collect()
        });
        let owned: Vec<ContextId> = self.server.with_model(|model| match &event {
            RegistrationEvent::ModuleStopped(module) => model
                .contexts()
                .logical_contexts()
                .filter(|c| c.owner() == Some(module))
                .map(|c| c.id().clone())
                .collect(),
            _ => Vec::new(),
        });

        let mut batch = Batch::new(event_label(&event));
        // context removals go last, after the elements that target them moved away
        let mut trailing = Vec::new();
        match event {
            RegistrationEvent::RegisterContext(context) => {
                contexts.insert(context.id().clone());
                batch.add(Change::AddLogicalContext(context));
                retarget_all(&mut next, &contexts, &mut batch);
            }
            RegistrationEvent::Register { element, selector } => {
                let element = Arc::new(element);
                let targets = selector.resolve(&contexts);
                if let Some(targets) = &targets {
                    batch.add(Change::AddElement(Arc::new(
                        element.with_targets(targets.clone()),
                    )));
                }
                next.elements.insert(
                    element.id(),
                    Tracked {
                        element,
                        selector,
                        targets,
                    },
                );
            }
            RegistrationEvent::Unregister(id) => match next.elements.remove(&id) {
                Some(Tracked { targets: None, .. }) => {}
                _ => {
                    batch.add(Change::RemoveElement(id));
                }
            },
            RegistrationEvent::ContextChanged { context, change } => match change {
                ContextChange::Rank(rank) => {
                    batch.add(Change::UpdateContextRank { context, rank });
                }
                ContextChange::Removed => {
                    contexts.remove(&context);
                    retarget_all(&mut next, &contexts, &mut batch);
                    trailing.push(Change::RemoveLogicalContext(context));
                }
            },
            RegistrationEvent::ModuleStopped(module) => {
                let withdrawn: Vec<ElementId> = next
                    .elements
                    .iter()
                    .filter(|(_, tracked)| tracked.element.owner() == Some(&module))
                    .map(|(id, _)| *id)
                    .collect();
                for id in withdrawn {
                    if let Some(Tracked {
                        targets: Some(_), ..
                    }) = next.elements.remove(&id)
                    {
                        batch.add(Change::RemoveElement(id));
                    }
                }
                for context in owned {
                    contexts.remove(&context);
                    trailing.push(Change::RemoveLogicalContext(context));
                }
                retarget_all(&mut next, &contexts, &mut batch);
            }
        }
        for change in trailing {
            batch.add(change);
        }

        if batch.is_empty() {
            *tracking = next;
            return Ok(None);
        }
        let report = self.server.submit(batch)?;
        *tracking = next;
        Ok(Some(report))
    }
}

/// Re-resolves every tracked selector against `contexts` and adds the resulting changes.
fn retarget_all(tracking: &mut Tracking, contexts: &BTreeSet<ContextId>, batch: &mut Batch) {
    for (id, tracked) in tracking.elements.iter_mut() {
        let targets = tracked.selector.resolve(contexts);
        if targets == tracked.targets {
            continue;
        }
        match (&tracked.targets, &targets) {
            (None, Some(targets)) => {
                batch.add(Change::AddElement(Arc::new(
                    tracked.element.with_targets(targets.clone()),
                )));
            }
            (Some(_), Some(targets)) => {
                batch.add(Change::RetargetElement {
                    element: *id,
                    targets: targets.clone(),
                });
            }
            (Some(_), None) => {
                debug!(element = %tracked.element, "no context left, registration pending");
                batch.add(Change::RemoveElement(*id));
            }
            (None, None) => {}
        }
        tracked.targets = targets;
    }
}

fn event_label(event: &RegistrationEvent) -> String {
    match event {
        RegistrationEvent::RegisterContext(context) => format!("register context {}", context.id()),
        RegistrationEvent::Register { element, .. } => format!("register {element}"),
        RegistrationEvent::Unregister(id) => format!("unregister {id}"),
        RegistrationEvent::ContextChanged { context, change } => {
            format!("context {context} changed: {change:?}")
        }
        RegistrationEvent::ModuleStopped(module) => format!("module {module} stopped"),
    }
}
