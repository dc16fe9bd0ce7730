//! Two-level context addressing: physical mount points and the logical contexts layered on them.
//!
//! A [`PhysicalContext`] is one URL path prefix of the server. Any number of [`LogicalContext`]s
//! bind to it, and the one with the best `(rank desc, creation order asc)` priority is the
//! highest-priority context of that mount point. The [`ContextModel`] only maintains these two
//! maps; it never touches elements.
use std::{
    cmp::Reverse,
    collections::BTreeMap,
    fmt,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use serde::{Deserialize, Serialize};

use crate::{util::normalize_context_path, ValidationError};

mod helper;
pub use helper::{ContextHelper, DefaultContextHelper, RequiredHeader, ScopedView};

static CONTEXT_ORDER: AtomicU64 = AtomicU64::new(1);

/// A normalized mount path. The root context is `/`.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ContextPath(Arc<str>);

impl ContextPath {
    pub fn parse(path: &str) -> Result<Self, ValidationError> {
        normalize_context_path(path).map(|p| Self(p.into()))
    }

    pub fn root() -> Self {
        Self("/".into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_root(&self) -> bool {
        &*self.0 == "/"
    }

    /// The prefix prepended to in-context paths, empty for the root context.
    pub fn prefix(&self) -> &str {
        if self.is_root() {
            ""
        } else {
            &self.0
        }
    }
}

impl fmt::Display for ContextPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for ContextPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", &*self.0)
    }
}

impl Serialize for ContextPath {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0)
    }
}

/// Name of a logical context, unique per server.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContextId(Arc<str>);

impl ContextId {
    pub fn new(id: &str) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for ContextId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for ContextId {
    fn from(id: String) -> Self {
        Self(id.into())
    }
}

impl fmt::Display for ContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for ContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", &*self.0)
    }
}

/// Identity of the module (registration source) that published a context or element.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct ModuleHandle {
    pub id: u64,
    pub name: Arc<str>,
}

impl ModuleHandle {
    pub fn new(id: u64, name: &str) -> Self {
        Self {
            id,
            name: name.into(),
        }
    }
}

impl fmt::Display for ModuleHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}]", self.name, self.id)
    }
}

const DEFAULT_SESSION_TIMEOUT_MINUTES: u32 = 30;

macro_rules! define_const {
    ($name: ident, $val: expr, $type: ty) => {
        const fn $name() -> $type {
            $val
        }
    };
}

define_const!(default_session_timeout, DEFAULT_SESSION_TIMEOUT_MINUTES, u32);

fn default_cookie_name() -> String {
    "JSESSIONID".to_string()
}

/// Session settings carried by a logical context; only engine adapters interpret them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionConfig {
    #[serde(default = "default_session_timeout")]
    pub timeout_minutes: u32,
    #[serde(default = "default_cookie_name")]
    pub cookie_name: String,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            timeout_minutes: default_session_timeout(),
            cookie_name: default_cookie_name(),
        }
    }
}

/// A named security and resource scope bound to one physical context.
#[derive(Clone)]
pub struct LogicalContext {
    id: ContextId,
    path: ContextPath,
    rank: i32,
    order: u64,
    owner: Option<ModuleHandle>,
    helper: Arc<dyn ContextHelper>,
    init_params: BTreeMap<String, String>,
    session: SessionConfig,
}

impl LogicalContext {
    /// Creates a context with rank 0 and the default helper. The creation order is taken from a
    /// process-wide counter, so contexts created earlier win rank ties.
    pub fn new(id: impl Into<ContextId>, path: &str) -> Result<Self, ValidationError> {
        Ok(Self {
            id: id.into(),
            path: ContextPath::parse(path)?,
            rank: 0,
            order: CONTEXT_ORDER.fetch_add(1, Ordering::Relaxed),
            owner: None,
            helper: Arc::new(DefaultContextHelper::default()),
            init_params: BTreeMap::new(),
            session: SessionConfig::default(),
        })
    }

    pub fn with_rank(mut self, rank: i32) -> Self {
        self.rank = rank;
        self
    }

    pub fn with_owner(mut self, owner: ModuleHandle) -> Self {
        self.owner = Some(owner);
        self
    }

    pub fn with_helper(mut self, helper: Arc<dyn ContextHelper>) -> Self {
        self.helper = helper;
        self
    }

    pub fn with_init_param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.init_params.insert(key.into(), value.into());
        self
    }

    pub fn with_session(mut self, session: SessionConfig) -> Self {
        self.session = session;
        self
    }

    pub fn id(&self) -> &ContextId {
        &self.id
    }

    pub fn path(&self) -> &ContextPath {
        &self.path
    }

    pub fn rank(&self) -> i32 {
        self.rank
    }

    pub fn order(&self) -> u64 {
        self.order
    }

    pub fn owner(&self) -> Option<&ModuleHandle> {
        self.owner.as_ref()
    }

    pub fn helper(&self) -> &Arc<dyn ContextHelper> {
        &self.helper
    }

    pub fn init_params(&self) -> &BTreeMap<String, String> {
        &self.init_params
    }

    pub fn session(&self) -> &SessionConfig {
        &self.session
    }

    /// Sort key: higher rank first, then earlier creation.
    pub fn priority(&self) -> (Reverse<i32>, u64) {
        (Reverse(self.rank), self.order)
    }
}

impl fmt::Debug for LogicalContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LogicalContext")
            .field("id", &self.id)
            .field("path", &self.path)
            .field("rank", &self.rank)
            .field("order", &self.order)
            .field("owner", &self.owner)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhysicalContext {
    path: ContextPath,
    /// Explicitly created contexts survive without any logical context bound.
    pinned: bool,
    /// Bound logical contexts, highest priority first.
    bound: Vec<ContextId>,
}

impl PhysicalContext {
    fn new(path: ContextPath) -> Self {
        Self {
            path,
            pinned: false,
            bound: Vec::new(),
        }
    }

    pub fn path(&self) -> &ContextPath {
        &self.path
    }

    pub fn is_pinned(&self) -> bool {
        self.pinned
    }

    pub fn bound(&self) -> &[ContextId] {
        &self.bound
    }
}

#[derive(Debug, Clone, Default)]
pub struct ContextModel {
    physical: BTreeMap<ContextPath, PhysicalContext>,
    logical: BTreeMap<ContextId, LogicalContext>,
}

impl ContextModel {
    pub fn get_or_create_physical_context(&mut self, path: &ContextPath) -> &mut PhysicalContext {
        self.physical
            .entry(path.clone())
            .or_insert_with(|| PhysicalContext::new(path.clone()))
    }

    /// Creates (or pins an existing) physical context so it outlives its logical contexts.
    pub fn add_physical_context(&mut self, path: &ContextPath) {
        self.get_or_create_physical_context(path).pinned = true;
    }

    pub fn remove_physical_context(&mut self, path: &ContextPath) -> Result<(), ValidationError> {
        let physical = self
            .physical
            .get(path)
            .ok_or_else(|| ValidationError::UnknownPhysicalContext(path.to_string()))?;
        if let Some(context) = physical.bound.first() {
            return Err(ValidationError::PhysicalContextInUse {
                path: path.to_string(),
                context: context.clone(),
            });
        }
        self.physical.remove(path);
        Ok(())
    }

    pub fn bind_logical_context(&mut self, context: LogicalContext) -> Result<(), ValidationError> {
        if self.logical.contains_key(context.id()) {
            return Err(ValidationError::DuplicateContext(context.id().clone()));
        }
        let path = context.path().clone();
        self.get_or_create_physical_context(&path)
            .bound
            .push(context.id().clone());
        self.logical.insert(context.id().clone(), context);
        self.sort_bound(&path);
        Ok(())
    }

    /// Removes a logical context. Elements still targeting it are left for the next resolution.
    pub fn unbind_logical_context(
        &mut self,
        id: &ContextId,
    ) -> Result<LogicalContext, ValidationError> {
        let context = self
            .logical
            .remove(id)
            .ok_or_else(|| ValidationError::UnknownContext(id.clone()))?;
        if let Some(physical) = self.physical.get_mut(context.path()) {
            physical.bound.retain(|bound| bound != id);
            if physical.bound.is_empty() && !physical.pinned {
                self.physical.remove(context.path());
            }
        }
        Ok(context)
    }

    pub fn update_rank(&mut self, id: &ContextId, rank: i32) -> Result<(), ValidationError> {
        let context = self
            .logical
            .get_mut(id)
            .ok_or_else(|| ValidationError::UnknownContext(id.clone()))?;
        context.rank = rank;
        let path = context.path().clone();
        self.sort_bound(&path);
        Ok(())
    }

    pub fn highest_priority_logical_context(&self, path: &ContextPath) -> Option<&LogicalContext> {
        self.physical
            .get(path)?
            .bound
            .first()
            .and_then(|id| self.logical.get(id))
    }

    pub fn logical_context(&self, id: &ContextId) -> Option<&LogicalContext> {
        self.logical.get(id)
    }

    pub fn physical_context(&self, path: &ContextPath) -> Option<&PhysicalContext> {
        self.physical.get(path)
    }

    pub fn logical_contexts(&self) -> impl Iterator<Item = &LogicalContext> {
        self.logical.values()
    }

    pub fn physical_contexts(&self) -> impl Iterator<Item = &PhysicalContext> {
        self.physical.values()
    }

    /// Logical contexts bound to `path`, highest priority first.
    pub fn bound_contexts(&self, path: &ContextPath) -> Vec<&LogicalContext> {
        self.physical
            .get(path)
            .map(|physical| {
                physical
                    .bound
                    .iter()
                    .filter_map(|id| self.logical.get(id))
                    .collect()
            })
            .unwrap_or_default()
    }

    fn sort_bound(&mut self, path: &ContextPath) {
        let logical = &self.logical;
        if let Some(physical) = self.physical.get_mut(path) {
            physical
                .bound
                .sort_by_key(|id| logical.get(id).map(LogicalContext::priority));
        }
    }
}
