//! The batch engine.
//!
//! A [`WebServer`] owns the model and serializes every structural change through
//! [`WebServer::submit`]. Request dispatch never touches the model: it reads the
//! [`ActiveTable`] swapped in after each committed batch.
use std::{
    collections::BTreeSet,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
};

use arc_swap::ArcSwap;
use bytes::Bytes;
use http::Request;
use parking_lot::{Mutex, MutexGuard};
use tracing::{info, warn};

use crate::{
    config::ServerConfig,
    context::{ContextId, ContextPath, LogicalContext},
    dispatch::{self, ActiveTable, Dispatched, RequestInfo},
    element::{ClassRegistry, ElementId},
    engine::EngineAdapter,
    AnyResult, BatchError, DispatchError,
};

mod batch;
mod model;
mod snapshot;

pub use batch::{Batch, BatchReport, Change};
pub use model::{ElementState, ServerModel};
pub use snapshot::{ElementSnapshot, LogicalSnapshot, ModelSnapshot, PhysicalSnapshot};

pub struct WebServer {
    config: ServerConfig,
    // Held for the whole submit; batches never interleave.
    model: Mutex<ServerModel>,
    table: ArcSwap<ActiveTable>,
    engine: Arc<dyn EngineAdapter>,
    registry: Arc<ClassRegistry>,
    service_ids: AtomicU64,
    started: AtomicBool,
}

impl WebServer {
    pub fn new(
        config: ServerConfig,
        engine: Arc<dyn EngineAdapter>,
        registry: Arc<ClassRegistry>,
    ) -> Self {
        let model = ServerModel::new(
            config.arbitration,
            ContextId::from(config.default_context.as_str()),
        );
        Self {
            config,
            model: Mutex::new(model),
            table: ArcSwap::from_pointee(ActiveTable::default()),
            engine,
            registry,
            service_ids: AtomicU64::new(1),
            started: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<ClassRegistry> {
        &self.registry
    }

    pub fn engine(&self) -> &Arc<dyn EngineAdapter> {
        &self.engine
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }

    /// Configures and starts the engine, then binds the default context.
    pub fn start(&self) -> AnyResult<()> {
        if self.started.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let result = self.start_inner();
        if result.is_err() {
            self.started.store(false, Ordering::Release);
        }
        result
    }

    fn start_inner(&self) -> AnyResult<()> {
        self.engine.configure(&self.config.engine)?;
        self.engine.start()?;
        let default = LogicalContext::new(
            self.config.default_context.as_str(),
            &self.config.default_context_path,
        )?;
        let mut batch = self.begin_batch("bootstrap");
        batch.add(Change::AddLogicalContext(default));
        self.submit(batch)?;
        info!(engine = self.engine.name(), "web server started");
        Ok(())
    }

    /// Withdraws everything from the engine and stops it. The server counts as started again
    /// when either step fails.
    pub fn stop(&self) -> AnyResult<()> {
        if !self.started.swap(false, Ordering::AcqRel) {
            return Ok(());
        }
        let result = self.stop_inner();
        if result.is_err() {
            self.started.store(true, Ordering::Release);
        }
        result
    }

    fn stop_inner(&self) -> AnyResult<()> {
        self.submit_with("shutdown", |model| {
            let mut changes: Vec<Change> = model
                .elements()
                .map(|state| Change::RemoveElement(state.model().id()))
                .collect();
            for context in model.contexts().logical_contexts() {
                changes.push(Change::RemoveLogicalContext(context.id().clone()));
            }
            for physical in model.contexts().physical_contexts() {
                if physical.is_pinned() {
                    changes.push(Change::RemovePhysicalContext(physical.path().clone()));
                }
            }
            changes
        })?;
        self.engine.stop()?;
        info!(engine = self.engine.name(), "web server stopped");
        Ok(())
    }

    pub fn begin_batch(&self, label: impl Into<String>) -> Batch {
        Batch::new(label)
    }

    /// Applies `batch` as one unit.
    ///
    /// Every change is validated against the model as left by the changes before it. The
    /// first invalid change rejects the whole batch. Otherwise the affected conflict groups are
    /// re-arbitrated and the resulting effects go to the engine in one call; if the engine
    /// refuses them the model stays as it was.
    pub fn submit(&self, batch: Batch) -> Result<BatchReport, BatchError> {
        let model = self.model.lock();
        self.commit(model, &batch)
    }

    /// Like [`submit`](Self::submit), with the changes derived from the committed model while
    /// the batch lock is already held.
    pub fn submit_with(
        &self,
        label: impl Into<String>,
        changes: impl FnOnce(&ServerModel) -> Vec<Change>,
    ) -> Result<BatchReport, BatchError> {
        let model = self.model.lock();
        let mut batch = self.begin_batch(label);
        for change in changes(&model) {
            batch.add(change);
        }
        self.commit(model, &batch)
    }

    fn commit(
        &self,
        mut model: MutexGuard<'_, ServerModel>,
        batch: &Batch,
    ) -> Result<BatchReport, BatchError> {
        let mut working = model.clone();
        let mut refresh: BTreeSet<ContextPath> = BTreeSet::new();
        for (index, change) in batch.changes().iter().enumerate() {
            working
                .apply(change)
                .map_err(|source| BatchError::Validation {
                    label: batch.label().to_string(),
                    index,
                    op: change.to_string(),
                    source,
                })?;
            if let Change::RefreshFilters(path) = change {
                refresh.insert(path.clone());
            }
        }

        let iterations = batch::rearbitrate(&model, &mut working);
        let effects = batch::compute_effects(&model, &working, &refresh);
        if !effects.is_empty() {
            if let Err(source) = self.engine.apply_batch_effects(&effects) {
                warn!(label = batch.label(), "engine rejected batch: {source}");
                return Err(BatchError::Engine {
                    label: batch.label().to_string(),
                    source,
                });
            }
        }

        *model = working;
        self.table.store(Arc::new(ActiveTable::build(&model)));
        info!(
            label = batch.label(),
            changes = batch.len(),
            effects = effects.len(),
            iterations,
            fingerprint = %ModelSnapshot::capture(&model).fingerprint,
            "batch committed"
        );
        drop(model);
        // the batch lock is released before user callbacks run
        self.engine.batch_committed();
        Ok(BatchReport {
            label: batch.label().to_string(),
            effects,
            iterations,
        })
    }

    /// The routing table requests are currently dispatched against.
    pub fn snapshot(&self) -> Arc<ActiveTable> {
        self.table.load_full()
    }

    pub fn model_snapshot(&self) -> ModelSnapshot {
        ModelSnapshot::capture(&self.model.lock())
    }

    /// Runs `f` against the committed model.
    pub fn with_model<R>(&self, f: impl FnOnce(&ServerModel) -> R) -> R {
        f(&self.model.lock())
    }

    /// Monotonic service ids for registrations originating in this process.
    pub fn next_service_id(&self) -> u64 {
        self.service_ids.fetch_add(1, Ordering::Relaxed)
    }

    pub fn is_enabled(&self, element: ElementId) -> bool {
        self.model
            .lock()
            .element(element)
            .is_some_and(|state| !state.enabled_in().is_empty())
    }

    pub fn enabled_in(&self, element: ElementId) -> Vec<ContextPath> {
        self.model
            .lock()
            .element(element)
            .map(|state| state.enabled_in().iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn dispatch(&self, request: Request<Bytes>) -> Result<Dispatched, DispatchError> {
        let table = self.table.load();
        dispatch::execute(&table, &self.registry, request)
    }

    pub fn request_info(&self, path: &str) -> RequestInfo {
        let table = self.table.load();
        match dispatch::compose(&table, path) {
            Some(plan) => plan.info(path),
            None => RequestInfo::not_found(path),
        }
    }
}

impl std::fmt::Debug for WebServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebServer")
            .field("engine", &self.engine.name())
            .field("started", &self.is_started())
            .finish()
    }
}

#[cfg(test)]
mod tests;
