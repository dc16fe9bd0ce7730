use std::{collections::BTreeMap, sync::Arc};

use super::select::{NoMatch, Select};
use crate::{
    context::{ContextPath, LogicalContext},
    element::{ElementDetails, ElementKind, ElementModel, ErrorKey},
    server::ServerModel,
    util::{pattern::PatternMatch, strip_context_path},
};

/// An enabled servlet or resource and the logical context it is served under.
#[derive(Debug, Clone)]
pub struct ActiveServlet {
    pub element: Arc<ElementModel>,
    pub context: Option<LogicalContext>,
}

/// The enabled elements of one physical context.
#[derive(Debug, Clone)]
pub struct Mount {
    pub path: ContextPath,
    /// Bound logical contexts, highest priority first.
    pub contexts: Vec<LogicalContext>,
    /// Servlets and resources in tie-break order.
    pub servlets: Vec<ActiveServlet>,
    /// Context-scoped filters in chain order.
    pub filters: Vec<Arc<ElementModel>>,
    pub error_pages: Vec<Arc<ElementModel>>,
    pub welcome_files: Vec<Arc<ElementModel>>,
}

impl Mount {
    pub fn highest_priority_context(&self) -> Option<&LogicalContext> {
        self.contexts.first()
    }
}

/// Best servlet for a path within the mount. Among equally good matches the element that comes
/// first in tie-break order wins.
impl Select<str> for Mount {
    type Output<'a>
        = (&'a ActiveServlet, PatternMatch)
    where
        Self: 'a;
    type Error = NoMatch;

    fn select(&self, path: &str) -> Result<Self::Output<'_>, Self::Error> {
        let mut best: Option<(&ActiveServlet, PatternMatch)> = None;
        for servlet in &self.servlets {
            let Some(matched) = servlet.element.match_path(path) else {
                continue;
            };
            if best.as_ref().map_or(true, |(_, b)| matched.kind > b.kind) {
                best = Some((servlet, matched));
            }
        }
        best.ok_or(NoMatch)
    }
}

/// The read-only routing table swapped in after every committed batch.
#[derive(Debug, Clone, Default)]
pub struct ActiveTable {
    /// Longest path first.
    mounts: Vec<Mount>,
    preprocessors: Vec<Arc<ElementModel>>,
}

impl ActiveTable {
    pub fn build(model: &ServerModel) -> Self {
        let mut mounts: BTreeMap<ContextPath, Mount> = model
            .contexts()
            .physical_contexts()
            .map(|physical| {
                let mount = Mount {
                    path: physical.path().clone(),
                    contexts: model
                        .contexts()
                        .bound_contexts(physical.path())
                        .into_iter()
                        .cloned()
                        .collect(),
                    servlets: Vec::new(),
                    filters: Vec::new(),
                    error_pages: Vec::new(),
                    welcome_files: Vec::new(),
                };
                (physical.path().clone(), mount)
            })
            .collect();

        let mut ordered: Vec<&Arc<ElementModel>> =
            model.elements().map(|state| state.model()).collect();
        ordered.sort_by_key(|e| e.tie_break_key());

        let mut preprocessors = Vec::new();
        for element in ordered {
            let Some(state) = model.element(element.id()) else {
                continue;
            };
            if element.is_preprocessor() && !state.enabled_in().is_empty() {
                preprocessors.push(element.clone());
                continue;
            }
            for path in state.enabled_in() {
                let Some(mount) = mounts.get_mut(path) else {
                    continue;
                };
                match element.kind() {
                    ElementKind::Servlet | ElementKind::Resource => {
                        mount.servlets.push(ActiveServlet {
                            element: element.clone(),
                            context: model.context_for(element, path).cloned(),
                        })
                    }
                    ElementKind::Filter => mount.filters.push(element.clone()),
                    ElementKind::ErrorPage => mount.error_pages.push(element.clone()),
                    ElementKind::WelcomeFile => mount.welcome_files.push(element.clone()),
                    ElementKind::Listener => {}
                }
            }
        }

        let mut mounts: Vec<Mount> = mounts.into_values().collect();
        mounts.sort_by(|a, b| b.path.as_str().len().cmp(&a.path.as_str().len()));
        Self {
            mounts,
            preprocessors,
        }
    }

    pub fn mounts(&self) -> &[Mount] {
        &self.mounts
    }

    pub fn preprocessors(&self) -> &[Arc<ElementModel>] {
        &self.preprocessors
    }

    /// The error page of `mount` handling `error_kind` or `status`, exception kinds first,
    /// then exact codes, then wildcards.
    pub fn error_page<'a>(
        mount: &'a Mount,
        error_kind: Option<&str>,
        status: http::StatusCode,
    ) -> Option<&'a str> {
        let mut best: Option<(u8, &str)> = None;
        for page in &mount.error_pages {
            let ElementDetails::ErrorPage { errors, location } = page.details() else {
                continue;
            };
            for error in errors {
                let score = match (error, error_kind) {
                    (ErrorKey::Exception(kind), Some(found)) if kind == found => Some(3),
                    _ => error.status_match(status),
                };
                if let Some(score) = score {
                    if best.map_or(true, |(b, _)| score > b) {
                        best = Some((score, location.as_str()));
                    }
                }
            }
        }
        best.map(|(_, location)| location)
    }
}

/// Longest-prefix selection of the mount point serving a request path.
impl Select<str> for ActiveTable {
    type Output<'a>
        = &'a Mount
    where
        Self: 'a;
    type Error = NoMatch;

    fn select(&self, path: &str) -> Result<Self::Output<'_>, Self::Error> {
        self.mounts
            .iter()
            .find(|mount| strip_context_path(mount.path.as_str(), path).is_some())
            .ok_or(NoMatch)
    }
}
