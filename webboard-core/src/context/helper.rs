use std::{
    collections::BTreeMap,
    fmt,
    path::{Component, Path, PathBuf},
    sync::Arc,
};

use http::StatusCode;

use super::{ContextId, ContextPath, LogicalContext, ModuleHandle, SessionConfig};
use crate::{
    http::{WebRequest, WebResponse},
    util::guess_mime_type,
};

/// Security and resource capabilities of a logical context.
///
/// Every method has a permissive default, so a helper only overrides what it cares about.
pub trait ContextHelper: Send + Sync {
    /// Returns `false` to reject the request. The helper may set a status on `resp`; when it
    /// leaves the response untouched the dispatcher answers 403.
    fn handle_security(&self, _req: &mut WebRequest, _resp: &mut WebResponse) -> bool {
        true
    }

    /// Called once after every `handle_security`, whatever happened in between.
    fn finish_security(&self, _req: &mut WebRequest) {}

    fn get_resource(&self, _module: Option<&ModuleHandle>, _name: &str) -> Option<PathBuf> {
        None
    }

    fn get_mime_type(&self, _module: Option<&ModuleHandle>, name: &str) -> Option<String> {
        guess_mime_type(name).map(str::to_string)
    }

    fn get_real_path(&self, _module: Option<&ModuleHandle>, _path: &str) -> Option<PathBuf> {
        None
    }
}

/// A header that must be present, optionally with a given value, for security to pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequiredHeader {
    pub name: String,
    pub value: Option<String>,
}

/// Helper backed by an optional resource directory and an optional header rule.
#[derive(Debug, Clone, Default)]
pub struct DefaultContextHelper {
    resource_base: Option<PathBuf>,
    required_header: Option<RequiredHeader>,
}

impl DefaultContextHelper {
    pub fn new(resource_base: Option<PathBuf>, required_header: Option<RequiredHeader>) -> Self {
        Self {
            resource_base,
            required_header,
        }
    }

    fn resolve(&self, name: &str) -> Option<PathBuf> {
        let base = self.resource_base.as_ref()?;
        let relative = Path::new(name.trim_start_matches('/'));
        if relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir))
        {
            return None;
        }
        Some(base.join(relative))
    }
}

impl ContextHelper for DefaultContextHelper {
    fn handle_security(&self, req: &mut WebRequest, resp: &mut WebResponse) -> bool {
        let Some(rule) = &self.required_header else {
            return true;
        };
        let passed = match (req.headers().get(rule.name.as_str()), &rule.value) {
            (None, _) => false,
            (Some(_), None) => true,
            (Some(found), Some(expected)) => found.as_bytes() == expected.as_bytes(),
        };
        if !passed {
            resp.set_status(StatusCode::FORBIDDEN);
        }
        passed
    }

    fn get_resource(&self, _module: Option<&ModuleHandle>, name: &str) -> Option<PathBuf> {
        self.resolve(name).filter(|p| p.is_file())
    }

    fn get_real_path(&self, _module: Option<&ModuleHandle>, path: &str) -> Option<PathBuf> {
        self.resolve(path)
    }
}

/// The context view handed to an element: a logical context seen from the element's module.
#[derive(Clone)]
pub struct ScopedView {
    context: LogicalContext,
    module: Option<ModuleHandle>,
}

impl ScopedView {
    pub fn new(context: LogicalContext, module: Option<ModuleHandle>) -> Self {
        Self { context, module }
    }

    pub fn context_id(&self) -> &ContextId {
        self.context.id()
    }

    pub fn context_path(&self) -> &ContextPath {
        self.context.path()
    }

    pub fn module(&self) -> Option<&ModuleHandle> {
        self.module.as_ref()
    }

    pub fn init_params(&self) -> &BTreeMap<String, String> {
        self.context.init_params()
    }

    pub fn session(&self) -> &SessionConfig {
        self.context.session()
    }

    pub fn helper(&self) -> &Arc<dyn ContextHelper> {
        self.context.helper()
    }

    pub fn get_resource(&self, name: &str) -> Option<PathBuf> {
        self.context.helper().get_resource(self.module(), name)
    }

    pub fn get_mime_type(&self, name: &str) -> Option<String> {
        self.context.helper().get_mime_type(self.module(), name)
    }

    pub fn get_real_path(&self, path: &str) -> Option<PathBuf> {
        self.context.helper().get_real_path(self.module(), path)
    }
}

impl fmt::Debug for ScopedView {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScopedView")
            .field("context", self.context.id())
            .field("module", &self.module)
            .finish()
    }
}
