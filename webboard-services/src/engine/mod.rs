//! The in-process engine adapter.
//!
//! Requests are dispatched by the core against its own routing table, so the only things this
//! engine materializes are the engine-side lifecycle of elements: listener notifications and
//! a mirror of what is mounted where, for introspection. Listener callbacks are queued while a
//! batch is applied and delivered from [`EngineAdapter::batch_committed`].
use std::{
    collections::{BTreeMap, BTreeSet},
    sync::Arc,
};

use parking_lot::Mutex;
use tracing::{debug, info};
use webboard_core::{
    config::EngineSettings,
    context::{ContextId, ContextPath, LogicalContext, ScopedView},
    element::{ClassRegistry, ElementDetails, ElementId, ElementKind, ElementModel},
    engine::{Effect, EngineAdapter},
    http::ContextListener,
    EngineError,
};

pub const ENGINE_NAME: &str = "in-process";
/// Engine property: reject activations of class references the registry cannot build.
pub const CHECK_CLASSES_PROPERTY: &str = "check_classes";

#[derive(Debug, Default)]
struct Mounted {
    contexts: BTreeSet<ContextId>,
    elements: BTreeMap<ElementId, Arc<ElementModel>>,
    filters: Vec<ElementId>,
}

type Listeners = BTreeMap<(ElementId, ContextPath), Arc<dyn ContextListener>>;

enum Notification {
    Initialized(Arc<dyn ContextListener>, ScopedView),
    Destroyed(Arc<dyn ContextListener>, ScopedView),
}

impl Notification {
    fn deliver(self) {
        match self {
            Notification::Initialized(listener, view) => listener.context_initialized(&view),
            Notification::Destroyed(listener, view) => listener.context_destroyed(&view),
        }
    }
}

#[derive(Default)]
struct EngineState {
    running: bool,
    check_classes: bool,
    mounts: BTreeMap<ContextPath, Mounted>,
    listeners: Listeners,
    pending: Vec<Notification>,
}

pub struct InProcessEngine {
    registry: Arc<ClassRegistry>,
    state: Mutex<EngineState>,
}

impl InProcessEngine {
    pub fn new(registry: Arc<ClassRegistry>) -> Self {
        Self {
            registry,
            state: Mutex::new(EngineState {
                check_classes: true,
                ..Default::default()
            }),
        }
    }

    pub fn is_running(&self) -> bool {
        self.state.lock().running
    }

    /// Mounted physical contexts.
    pub fn mounts(&self) -> Vec<ContextPath> {
        self.state.lock().mounts.keys().cloned().collect()
    }

    /// Elements active in `physical`, in id order.
    pub fn active_elements(&self, physical: &ContextPath) -> Vec<ElementId> {
        self.state
            .lock()
            .mounts
            .get(physical)
            .map(|m| m.elements.keys().copied().collect())
            .unwrap_or_default()
    }

    /// Filter chain of `physical` as last pushed by the core.
    pub fn filters(&self, physical: &ContextPath) -> Vec<ElementId> {
        self.state
            .lock()
            .mounts
            .get(physical)
            .map(|m| m.filters.clone())
            .unwrap_or_default()
    }

    /// Checks the whole batch against the current state before anything is touched, and
    /// resolves the listeners the batch activates.
    fn verify(&self, state: &EngineState, effects: &[Effect]) -> Result<Listeners, EngineError> {
        if !state.running {
            let first = effects.first().map(ToString::to_string).unwrap_or_default();
            return Err(EngineError::new(ENGINE_NAME, first, "engine is not running"));
        }
        let mut created: BTreeSet<&ContextPath> = BTreeSet::new();
        let mut resolved = Listeners::new();
        for effect in effects {
            match effect {
                Effect::CreatePhysical(path) => {
                    created.insert(path);
                }
                Effect::Activate {
                    element,
                    physical,
                    context,
                } => {
                    if !state.mounts.contains_key(physical) && !created.contains(physical) {
                        return Err(EngineError::new(
                            ENGINE_NAME,
                            effect.to_string(),
                            "physical context is not mounted",
                        ));
                    }
                    if state.check_classes {
                        self.verify_class(element)
                            .map_err(|reason| {
                                EngineError::new(ENGINE_NAME, effect.to_string(), reason)
                            })?;
                    }
                    if let (ElementDetails::Listener { source }, Some(_)) =
                        (element.details(), context)
                    {
                        let listener = source.resolve(&self.registry).map_err(|e| {
                            EngineError::new(ENGINE_NAME, effect.to_string(), e.to_string())
                        })?;
                        resolved.insert((element.id(), physical.clone()), listener);
                    }
                }
                _ => {}
            }
        }
        Ok(resolved)
    }

    fn verify_class(&self, element: &ElementModel) -> Result<(), String> {
        let Some(class) = element.class_name() else {
            return Ok(());
        };
        let known = match element.kind() {
            ElementKind::Servlet => self.registry.contains_servlet(class),
            ElementKind::Filter => self.registry.contains_filter(class),
            ElementKind::Listener => self.registry.contains_listener(class),
            _ => true,
        };
        if known {
            Ok(())
        } else {
            Err(format!("unknown class {class}"))
        }
    }

    fn activate(
        state: &mut EngineState,
        resolved: &mut Listeners,
        element: &Arc<ElementModel>,
        physical: &ContextPath,
        context: Option<&LogicalContext>,
    ) {
        if let Some(mounted) = state.mounts.get_mut(physical) {
            mounted.elements.insert(element.id(), element.clone());
        }
        let key = (element.id(), physical.clone());
        let (Some(listener), Some(context)) = (resolved.remove(&key), context) else {
            return;
        };
        let view = ScopedView::new(context.clone(), element.owner().cloned());
        state
            .pending
            .push(Notification::Initialized(listener.clone(), view));
        state.listeners.insert(key, listener);
    }

    fn deactivate(
        state: &mut EngineState,
        element: &ElementModel,
        physical: &ContextPath,
        context: Option<&LogicalContext>,
    ) {
        if let Some(mounted) = state.mounts.get_mut(physical) {
            mounted.elements.remove(&element.id());
        }
        let listener = state.listeners.remove(&(element.id(), physical.clone()));
        if let (Some(listener), Some(context)) = (listener, context) {
            let view = ScopedView::new(context.clone(), element.owner().cloned());
            state.pending.push(Notification::Destroyed(listener, view));
        }
    }
}

impl EngineAdapter for InProcessEngine {
    fn name(&self) -> &str {
        ENGINE_NAME
    }

    fn configure(&self, settings: &EngineSettings) -> Result<(), EngineError> {
        let check_classes = match settings.property(CHECK_CLASSES_PROPERTY) {
            None => true,
            Some(value) => value.parse::<bool>().map_err(|_| {
                EngineError::new(
                    ENGINE_NAME,
                    "configure",
                    format!("{CHECK_CLASSES_PROPERTY} must be true or false, got {value:?}"),
                )
            })?,
        };
        self.state.lock().check_classes = check_classes;
        debug!(check_classes, "in-process engine configured");
        Ok(())
    }

    fn start(&self) -> Result<(), EngineError> {
        self.state.lock().running = true;
        info!("in-process engine started");
        Ok(())
    }

    fn stop(&self) -> Result<(), EngineError> {
        let mut state = self.state.lock();
        state.running = false;
        state.mounts.clear();
        state.listeners.clear();
        info!("in-process engine stopped");
        Ok(())
    }

    fn apply_batch_effects(&self, effects: &[Effect]) -> Result<(), EngineError> {
        let mut state = self.state.lock();
        let mut resolved = self.verify(&state, effects)?;
        for effect in effects {
            debug!(%effect, "applying");
            match effect {
                Effect::CreatePhysical(path) => {
                    state.mounts.entry(path.clone()).or_default();
                }
                Effect::DestroyPhysical(path) => {
                    state.mounts.remove(path);
                }
                Effect::BindContext(context) => {
                    if let Some(mounted) = state.mounts.get_mut(context.path()) {
                        mounted.contexts.insert(context.id().clone());
                    }
                }
                Effect::UnbindContext { context, physical } => {
                    if let Some(mounted) = state.mounts.get_mut(physical) {
                        mounted.contexts.remove(context);
                    }
                }
                Effect::Activate {
                    element,
                    physical,
                    context,
                } => Self::activate(
                    &mut state,
                    &mut resolved,
                    element,
                    physical,
                    context.as_ref(),
                ),
                Effect::Deactivate {
                    element,
                    physical,
                    context,
                } => Self::deactivate(&mut state, element, physical, context.as_ref()),
                Effect::UpdateFilters { physical, filters } => {
                    if let Some(mounted) = state.mounts.get_mut(physical) {
                        mounted.filters = filters.iter().map(|f| f.id()).collect();
                    }
                }
            }
        }
        Ok(())
    }

    fn batch_committed(&self) {
        let pending = std::mem::take(&mut self.state.lock().pending);
        for notification in pending {
            notification.deliver();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        OnceLock, Weak,
    };

    use webboard_core::{
        config::ServerConfig,
        element::{ElementKind, ElementSource},
        server::{Batch, Change, WebServer},
        BatchError,
    };

    use super::*;

    #[derive(Default)]
    struct Counting {
        initialized: AtomicUsize,
        destroyed: AtomicUsize,
    }

    impl ContextListener for Counting {
        fn context_initialized(&self, view: &ScopedView) {
            assert_eq!("app", view.context_id().as_str());
            self.initialized.fetch_add(1, Ordering::SeqCst);
        }

        fn context_destroyed(&self, _view: &ScopedView) {
            self.destroyed.fetch_add(1, Ordering::SeqCst);
        }
    }

    /// Asks the server whether its own element is enabled from inside each callback.
    #[derive(Default)]
    struct ReadsBack {
        server: OnceLock<Weak<WebServer>>,
        element: OnceLock<ElementId>,
        seen: Mutex<Vec<bool>>,
    }

    impl ReadsBack {
        fn record(&self) {
            let server = self.server.get().and_then(Weak::upgrade);
            if let (Some(server), Some(id)) = (server, self.element.get()) {
                self.seen.lock().push(server.is_enabled(*id));
            }
        }
    }

    impl ContextListener for ReadsBack {
        fn context_initialized(&self, _view: &ScopedView) {
            self.record();
        }

        fn context_destroyed(&self, _view: &ScopedView) {
            self.record();
        }
    }

    fn server() -> (Arc<WebServer>, Arc<InProcessEngine>) {
        let registry = Arc::new(ClassRegistry::default());
        let engine = Arc::new(InProcessEngine::new(registry.clone()));
        let server = Arc::new(WebServer::new(
            ServerConfig::default(),
            engine.clone(),
            registry,
        ));
        server.start().unwrap();
        (server, engine)
    }

    #[test]
    fn test_listener_lifecycle() {
        let (server, engine) = server();
        let listener = Arc::new(Counting::default());
        let element = ElementModel::builder(ElementKind::Listener)
            .name("counting")
            .listener(listener.clone())
            .target_context("app")
            .build()
            .unwrap();
        let id = element.id();
        server
            .submit(
                Batch::new("app")
                    .with(Change::AddLogicalContext(
                        LogicalContext::new("app", "/app").unwrap(),
                    ))
                    .with(Change::add_element(element)),
            )
            .unwrap();
        let app = ContextPath::parse("/app").unwrap();
        assert_eq!(1, listener.initialized.load(Ordering::SeqCst));
        assert_eq!(vec![id], engine.active_elements(&app));

        server
            .submit(Batch::new("drop").with(Change::RemoveElement(id)))
            .unwrap();
        assert_eq!(1, listener.destroyed.load(Ordering::SeqCst));
        assert!(engine.active_elements(&app).is_empty());
    }

    #[test]
    fn test_listener_reads_server_back() {
        let (server, _) = server();
        let listener = Arc::new(ReadsBack::default());
        let element = ElementModel::builder(ElementKind::Listener)
            .name("reads-back")
            .listener(listener.clone())
            .build()
            .unwrap();
        let id = element.id();
        listener.server.set(Arc::downgrade(&server)).unwrap();
        listener.element.set(id).unwrap();

        server
            .submit(Batch::new("add").with(Change::add_element(element)))
            .unwrap();
        assert_eq!(vec![true], *listener.seen.lock());

        server
            .submit(Batch::new("drop").with(Change::RemoveElement(id)))
            .unwrap();
        assert_eq!(vec![true, false], *listener.seen.lock());
    }

    #[test]
    fn test_unresolvable_listener_rolls_back() {
        let registry = Arc::new(ClassRegistry::default());
        let engine = Arc::new(InProcessEngine::new(registry.clone()));
        let mut config = ServerConfig::default();
        config
            .engine
            .properties
            .insert(CHECK_CLASSES_PROPERTY.to_string(), "false".to_string());
        let server = WebServer::new(config, engine.clone(), registry);
        server.start().unwrap();
        let before = server.model_snapshot();

        let element = ElementModel::builder(ElementKind::Listener)
            .name("missing")
            .source(ElementSource::<dyn ContextListener>::class("demo.Missing"))
            .build()
            .unwrap();
        let err = server
            .submit(Batch::new("missing").with(Change::add_element(element)))
            .unwrap_err();
        match err {
            BatchError::Engine { source, .. } => assert!(source.reason.contains("demo.Missing")),
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(before, server.model_snapshot());
        assert!(engine.active_elements(&ContextPath::root()).is_empty());
    }

    #[test]
    fn test_unknown_class_rolls_back() {
        let (server, engine) = server();
        let before = server.model_snapshot();
        let element = ElementModel::builder(ElementKind::Servlet)
            .name("ghost")
            .source(ElementSource::<dyn webboard_core::http::Servlet>::class("demo.Ghost"))
            .url_pattern("/ghost")
            .build()
            .unwrap();
        let err = server
            .submit(Batch::new("ghost").with(Change::add_element(element)))
            .unwrap_err();
        match err {
            BatchError::Engine { source, .. } => assert!(source.reason.contains("demo.Ghost")),
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(before, server.model_snapshot());
        assert!(engine.active_elements(&ContextPath::root()).is_empty());
    }

    #[test]
    fn test_class_check_can_be_disabled() {
        let registry = Arc::new(ClassRegistry::default());
        let engine = Arc::new(InProcessEngine::new(registry.clone()));
        let mut config = ServerConfig::default();
        config
            .engine
            .properties
            .insert(CHECK_CLASSES_PROPERTY.to_string(), "false".to_string());
        let server = WebServer::new(config, engine, registry);
        server.start().unwrap();

        let element = ElementModel::builder(ElementKind::Servlet)
            .name("ghost")
            .source(ElementSource::<dyn webboard_core::http::Servlet>::class("demo.Ghost"))
            .url_pattern("/ghost")
            .build()
            .unwrap();
        server
            .submit(Batch::new("ghost").with(Change::add_element(element)))
            .unwrap();
    }

    #[test]
    fn test_rejects_before_start() {
        let engine = InProcessEngine::new(Arc::new(ClassRegistry::default()));
        let effects = [Effect::CreatePhysical(ContextPath::root())];
        assert!(engine.apply_batch_effects(&effects).is_err());
        engine.start().unwrap();
        engine.apply_batch_effects(&effects).unwrap();
        assert_eq!(vec![ContextPath::root()], engine.mounts());
    }

    #[test]
    fn test_filters_mirror() {
        let (server, engine) = server();
        let filter = ElementModel::builder(ElementKind::Filter)
            .name("noop")
            .source(ElementSource::<dyn webboard_core::http::Filter>::class("noop"))
            .url_pattern("/*")
            .build()
            .unwrap();
        server.registry().register_filter("noop", || {
            Arc::new(crate::builtin::AccessLogFilter) as Arc<dyn webboard_core::http::Filter>
        });
        let id = filter.id();
        server
            .submit(Batch::new("filters").with(Change::add_element(filter)))
            .unwrap();
        assert_eq!(vec![id], engine.filters(&ContextPath::root()));
    }
}
