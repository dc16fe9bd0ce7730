//! Per-request composition and execution.
//!
//! [`compose`] turns a request path and the active table into a [`DispatchPlan`]: the mount
//! point, the logical context view, the target servlet and the in-scope filters. [`execute`]
//! runs a plan: preprocessors, then security, then the filter chain and the target, and finally
//! error pages. Nothing here takes a lock; the table is an immutable snapshot.
use std::{
    any::Any,
    cell::Cell,
    panic::{catch_unwind, AssertUnwindSafe},
    sync::Arc,
};

use bytes::Bytes;
use http::{Request, Response, StatusCode};
use serde::Serialize;
use tracing::{debug, error};

use crate::{
    context::{LogicalContext, ScopedView},
    element::{ClassRegistry, ElementDetails, ElementId, ElementKind, ElementModel},
    http::{Filter, FilterChain, Servlet, WebRequest, WebResponse},
    util::{
        pattern::{MatchKind, PatternMatch},
        strip_context_path,
    },
    DispatchError, ServletError,
};

mod resource;
mod select;
mod table;

pub use resource::ResourceServlet;
pub use select::{NoMatch, Select};
pub use table::{ActiveServlet, ActiveTable, Mount};

/// Error kind given to collaborator panics.
pub const PANIC_KIND: &str = "panic";
/// Error kind given to elements whose instance could not be produced.
pub const INSTANTIATION_KIND: &str = "instantiation";

pub const ERROR_STATUS_ATTRIBUTE: &str = "webboard.error.status_code";
pub const ERROR_MESSAGE_ATTRIBUTE: &str = "webboard.error.message";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DispatchOutcome {
    /// A servlet or filter chain ran.
    Serviced,
    /// No physical context, or no chain at all.
    NotFound,
    /// The context's security handler rejected the request.
    Forbidden,
}

#[derive(Debug)]
pub struct Dispatched {
    pub outcome: DispatchOutcome,
    pub response: Response<Bytes>,
}

#[derive(Debug, Clone)]
pub enum Target<'t> {
    Servlet {
        servlet: &'t ActiveServlet,
        matched: PatternMatch,
    },
    /// Welcome file served by redirect.
    Redirect(String),
    NotFound,
}

/// Everything a request will run through.
#[derive(Debug, Clone)]
pub struct DispatchPlan<'t> {
    pub mount: &'t Mount,
    /// Request path relative to the mount.
    pub relative: String,
    pub view: Option<&'t LogicalContext>,
    pub target: Target<'t>,
    pub filters: Vec<&'t Arc<ElementModel>>,
    pub preprocessors: &'t [Arc<ElementModel>],
}

impl DispatchPlan<'_> {
    /// Neither a servlet nor a filter applies.
    pub fn is_empty(&self) -> bool {
        matches!(self.target, Target::NotFound) && self.filters.is_empty()
    }

    pub fn info(&self, path: &str) -> RequestInfo {
        let (servlet, match_kind, servlet_path, path_info, redirect) = match &self.target {
            Target::Servlet { servlet, matched } => (
                Some(ElementRef::from(servlet.element.as_ref())),
                Some(matched.kind),
                Some(matched.servlet_path.clone()),
                matched.path_info.clone(),
                None,
            ),
            Target::Redirect(location) => (None, None, None, None, Some(location.clone())),
            Target::NotFound => (None, None, None, None, None),
        };
        RequestInfo {
            path: path.to_string(),
            mount: Some(self.mount.path.to_string()),
            context: self.view.map(|c| c.id().to_string()),
            servlet,
            match_kind,
            servlet_path,
            path_info,
            redirect,
            filters: self.filters.iter().map(|f| ElementRef::from(f.as_ref())).collect(),
            preprocessors: self
                .preprocessors
                .iter()
                .map(|f| ElementRef::from(f.as_ref()))
                .collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ElementRef {
    pub id: ElementId,
    pub kind: ElementKind,
    pub name: String,
    pub rank: i32,
    pub service_id: u64,
}

impl From<&ElementModel> for ElementRef {
    fn from(element: &ElementModel) -> Self {
        Self {
            id: element.id(),
            kind: element.kind(),
            name: element.name().to_string(),
            rank: element.rank(),
            service_id: element.service_id(),
        }
    }
}

/// What a path resolves to, for inspection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RequestInfo {
    pub path: String,
    pub mount: Option<String>,
    pub context: Option<String>,
    pub servlet: Option<ElementRef>,
    pub match_kind: Option<MatchKind>,
    pub servlet_path: Option<String>,
    pub path_info: Option<String>,
    pub redirect: Option<String>,
    pub filters: Vec<ElementRef>,
    pub preprocessors: Vec<ElementRef>,
}

impl RequestInfo {
    pub fn not_found(path: &str) -> Self {
        Self {
            path: path.to_string(),
            mount: None,
            context: None,
            servlet: None,
            match_kind: None,
            servlet_path: None,
            path_info: None,
            redirect: None,
            filters: Vec::new(),
            preprocessors: Vec::new(),
        }
    }
}

/// Composes the plan for `path`. `None` means no physical context contains the path.
pub fn compose<'t>(table: &'t ActiveTable, path: &str) -> Option<DispatchPlan<'t>> {
    let mount = table.select(path).ok()?;
    let relative = strip_context_path(mount.path.as_str(), path)?.to_string();

    let mut target = match mount.select(relative.as_str()) {
        Ok((servlet, matched)) => Target::Servlet { servlet, matched },
        Err(NoMatch) => Target::NotFound,
    };
    let directory = relative.is_empty() || relative.ends_with('/');
    let precise = matches!(
        &target,
        Target::Servlet { matched, .. }
            if matches!(matched.kind, MatchKind::Exact | MatchKind::Extension)
    );
    if directory && !precise {
        if let Some(welcome) = welcome_target(mount, &relative) {
            target = welcome;
        }
    }

    let active: Option<&'t ActiveServlet> = match &target {
        Target::Servlet { servlet, .. } => Some(*servlet),
        _ => None,
    };
    let view = active
        .and_then(|servlet| servlet.context.as_ref())
        .or_else(|| mount.highest_priority_context());
    let servlet_name = active.map(|servlet| servlet.element.name());

    let filters = mount
        .filters
        .iter()
        .filter(|filter| in_scope(filter, mount, view))
        .filter(|filter| {
            filter.matches(&relative)
                || match (filter.details(), servlet_name) {
                    (ElementDetails::Filter { servlet_names, .. }, Some(name)) => {
                        servlet_names.iter().any(|n| n == name)
                    }
                    _ => false,
                }
        })
        .collect();

    Some(DispatchPlan {
        mount,
        relative,
        view,
        target,
        filters,
        preprocessors: table.preprocessors(),
    })
}

/// A filter takes part in a chain only for the logical contexts it targets. Filters without
/// targets follow the mount point's highest-priority context.
fn in_scope(filter: &ElementModel, mount: &Mount, view: Option<&LogicalContext>) -> bool {
    let Some(view) = view else {
        return false;
    };
    if filter.target_contexts().is_empty() {
        return mount
            .highest_priority_context()
            .is_some_and(|top| top.id() == view.id());
    }
    filter.target_contexts().contains(view.id())
}

fn welcome_target<'t>(mount: &'t Mount, relative: &str) -> Option<Target<'t>> {
    let directory = if relative.ends_with('/') {
        relative.to_string()
    } else {
        format!("{relative}/")
    };
    for welcome in &mount.welcome_files {
        let ElementDetails::WelcomeFile { files, redirect } = welcome.details() else {
            continue;
        };
        for file in files {
            let candidate = format!("{directory}{file}");
            let Ok((servlet, matched)) = mount.select(candidate.as_str()) else {
                continue;
            };
            let usable = match servlet.element.details() {
                ElementDetails::Resource { prefix } => servlet.context.as_ref().is_some_and(|c| {
                    let name = ResourceServlet::new(prefix)
                        .resource_name(&matched.servlet_path, matched.path_info.as_deref());
                    c.helper()
                        .get_resource(servlet.element.owner(), &name)
                        .is_some()
                }),
                _ => matches!(matched.kind, MatchKind::Exact | MatchKind::Extension),
            };
            if !usable {
                continue;
            }
            return Some(if *redirect {
                Target::Redirect(format!("{}{candidate}", mount.path.prefix()))
            } else {
                Target::Servlet { servlet, matched }
            });
        }
    }
    None
}

/// Composes and runs the request against `table`.
pub fn execute(
    table: &ActiveTable,
    registry: &ClassRegistry,
    request: Request<Bytes>,
) -> Result<Dispatched, DispatchError> {
    let path = request.uri().path().to_string();
    let mut resp = WebResponse::new();
    let Some(plan) = compose(table, &path) else {
        debug!(%path, "no physical context");
        resp.send_error(StatusCode::NOT_FOUND);
        return Ok(Dispatched {
            outcome: DispatchOutcome::NotFound,
            response: resp.into_http(),
        });
    };
    debug!(
        %path,
        mount = %plan.mount.path,
        context = ?plan.view.map(|c| c.id()),
        filters = plan.filters.len(),
        "request composed"
    );

    let mut req = WebRequest::new(request);
    req.set_paths(plan.mount.path.prefix(), plan.relative.clone(), None);
    req.set_view(plan.view.map(|c| ScopedView::new(c.clone(), None)));

    let preprocessors = instances(registry, plan.preprocessors.iter())?;
    let filters = instances(registry, plan.filters.iter().copied())?;

    let outcome = Cell::new(DispatchOutcome::NotFound);
    let secured = |req: &mut WebRequest, resp: &mut WebResponse| -> Result<(), ServletError> {
        run_secured(&plan, registry, &filters, &outcome, req, resp)
    };
    let result = catch_unwind(AssertUnwindSafe(|| {
        FilterChain::new(&preprocessors, &secured).proceed(&mut req, &mut resp)
    }));
    let failure = match result {
        Ok(Ok(())) => None,
        Ok(Err(e)) => Some(e),
        Err(panic) => Some(ServletError::with_kind(PANIC_KIND, panic_message(panic))),
    };

    handle_errors(&plan, registry, failure, &mut req, &mut resp)?;
    Ok(Dispatched {
        outcome: outcome.get(),
        response: resp.into_http(),
    })
}

/// Security handling around the filter chain and the target. `finish_security` runs exactly
/// once after `handle_security`, whether the chain returned, failed or panicked.
fn run_secured(
    plan: &DispatchPlan<'_>,
    registry: &ClassRegistry,
    filters: &[Arc<dyn Filter>],
    outcome: &Cell<DispatchOutcome>,
    req: &mut WebRequest,
    resp: &mut WebResponse,
) -> Result<(), ServletError> {
    if plan.is_empty() {
        resp.send_error(StatusCode::NOT_FOUND);
        outcome.set(DispatchOutcome::NotFound);
        return Ok(());
    }

    let helper = plan.view.map(|c| c.helper().clone());
    let result = catch_unwind(AssertUnwindSafe(|| {
        if let Some(helper) = &helper {
            if !helper.handle_security(req, resp) {
                return Ok(false);
            }
        }
        let target = |req: &mut WebRequest, resp: &mut WebResponse| -> Result<(), ServletError> {
            invoke_target(plan, registry, req, resp)
        };
        FilterChain::new(filters, &target).proceed(req, resp)?;
        Ok(true)
    }));
    if let Some(helper) = &helper {
        helper.finish_security(req);
    }

    match result {
        Ok(Ok(true)) => {
            outcome.set(DispatchOutcome::Serviced);
            Ok(())
        }
        Ok(Ok(false)) => {
            if !resp.status().is_client_error() {
                resp.send_error(StatusCode::FORBIDDEN);
            }
            outcome.set(DispatchOutcome::Forbidden);
            Ok(())
        }
        Ok(Err(e)) => {
            outcome.set(DispatchOutcome::Serviced);
            Err(e)
        }
        Err(panic) => {
            outcome.set(DispatchOutcome::Serviced);
            Err(ServletError::with_kind(PANIC_KIND, panic_message(panic)))
        }
    }
}

fn invoke_target(
    plan: &DispatchPlan<'_>,
    registry: &ClassRegistry,
    req: &mut WebRequest,
    resp: &mut WebResponse,
) -> Result<(), ServletError> {
    match &plan.target {
        Target::Servlet { servlet, matched } => {
            req.set_paths(
                plan.mount.path.prefix(),
                matched.servlet_path.clone(),
                matched.path_info.clone(),
            );
            invoke_servlet(servlet, registry, req, resp)
        }
        Target::Redirect(location) => {
            resp.send_redirect(location);
            Ok(())
        }
        Target::NotFound => {
            resp.send_error(StatusCode::NOT_FOUND);
            Ok(())
        }
    }
}

fn invoke_servlet(
    servlet: &ActiveServlet,
    registry: &ClassRegistry,
    req: &mut WebRequest,
    resp: &mut WebResponse,
) -> Result<(), ServletError> {
    let element = &servlet.element;
    req.set_view(
        servlet
            .context
            .clone()
            .map(|c| ScopedView::new(c, element.owner().cloned())),
    );
    match element.details() {
        ElementDetails::Servlet { source } => source
            .resolve(registry)
            .map_err(|e| ServletError::with_kind(INSTANTIATION_KIND, e.to_string()))?
            .service(req, resp),
        ElementDetails::Resource { prefix } => ResourceServlet::new(prefix).service(req, resp),
        _ => Err(ServletError::new(format!("{element} cannot service requests"))),
    }
}

/// Forwards to an error page when the chain failed, or ended with an error status and no body.
fn handle_errors(
    plan: &DispatchPlan<'_>,
    registry: &ClassRegistry,
    failure: Option<ServletError>,
    req: &mut WebRequest,
    resp: &mut WebResponse,
) -> Result<(), DispatchError> {
    let status = match &failure {
        Some(_) => StatusCode::INTERNAL_SERVER_ERROR,
        None if resp.status().as_u16() >= 400 && resp.body().is_empty() => resp.status(),
        None => return Ok(()),
    };
    let kind = failure.as_ref().and_then(|e| e.kind.as_deref());
    let page = ActiveTable::error_page(plan.mount, kind, status).and_then(|location| {
        plan.mount
            .select(location)
            .ok()
            .map(|(servlet, matched)| (location, servlet, matched))
    });

    let Some((location, servlet, matched)) = page else {
        return match failure {
            Some(e) if e.kind.as_deref() == Some(PANIC_KIND) => {
                error!(path = %req.path(), "collaborator panicked: {}", e.message);
                Err(DispatchError::Panic(e.message))
            }
            Some(e) => {
                error!(path = %req.path(), "dispatch failed: {e}");
                Err(DispatchError::Servlet(e))
            }
            None => Ok(()),
        };
    };

    debug!(path = %req.path(), %location, %status, "forwarding to error page");
    req.set_attribute(ERROR_STATUS_ATTRIBUTE, status.as_u16().to_string());
    if let Some(e) = &failure {
        req.set_attribute(ERROR_MESSAGE_ATTRIBUTE, e.message.clone());
    }
    req.set_paths(
        plan.mount.path.prefix(),
        matched.servlet_path.clone(),
        matched.path_info.clone(),
    );
    resp.send_error(status);
    let forwarded = catch_unwind(AssertUnwindSafe(|| {
        invoke_servlet(servlet, registry, req, resp)
    }));
    match forwarded {
        Ok(Ok(())) => {
            resp.set_status(status);
            Ok(())
        }
        Ok(Err(e)) => Err(DispatchError::Servlet(e)),
        Err(panic) => Err(DispatchError::Panic(panic_message(panic))),
    }
}

fn instances<'a, I>(
    registry: &ClassRegistry,
    filters: I,
) -> Result<Vec<Arc<dyn Filter>>, DispatchError>
where
    I: Iterator<Item = &'a Arc<ElementModel>>,
{
    filters
        .filter_map(|element| match element.details() {
            ElementDetails::Filter { source, .. } => Some(source.resolve(registry)),
            _ => None,
        })
        .collect()
}

fn panic_message(panic: Box<dyn Any + Send>) -> String {
    match panic.downcast::<String>() {
        Ok(message) => *message,
        Err(panic) => match panic.downcast::<&'static str>() {
            Ok(message) => message.to_string(),
            Err(panic) => format!("{panic:?}"),
        },
    }
}
