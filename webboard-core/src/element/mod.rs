//! Web elements and their validated construction.
//!
//! An [`ElementModel`] is immutable once built. The batch engine attaches the computed
//! "enabled in" set next to it rather than inside it, so a model can be shared between the
//! pre-batch and post-batch state without copying.
use std::{
    collections::BTreeMap,
    fmt,
    str::FromStr,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use derive_more::{From, Into};
use http::StatusCode;
use serde::Serialize;

use crate::{
    context::{ContextId, ModuleHandle},
    http::{ContextListener, Filter, Servlet},
    util::pattern::{PatternMatch, Patterns},
    ValidationError,
};

mod source;
pub use source::{ClassRegistry, ElementSource, Instantiate, SupplierScope};

static ELEMENT_SEQ: AtomicU64 = AtomicU64::new(1);

/// Identity assigned to every built element. Ids are unique per process and increase in build
/// order, which also makes them the last tie-breaker between competing elements.
#[derive(From, Into, Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(transparent)]
pub struct ElementId(u64);

impl ElementId {
    fn next() -> Self {
        Self(ELEMENT_SEQ.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ElementId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ElementKind {
    Servlet,
    Filter,
    Listener,
    Resource,
    ErrorPage,
    WelcomeFile,
}

impl fmt::Display for ElementKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ElementKind::Servlet => "servlet",
            ElementKind::Filter => "filter",
            ElementKind::Listener => "listener",
            ElementKind::Resource => "resource",
            ElementKind::ErrorPage => "error page",
            ElementKind::WelcomeFile => "welcome file",
        };
        f.write_str(name)
    }
}

/// What an error page handles.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKey {
    Code(u16),
    /// `4xx`
    ClientErrors,
    /// `5xx`
    ServerErrors,
    /// A [`ServletError`](crate::ServletError) kind.
    Exception(String),
}

impl ErrorKey {
    /// Specificity of a match against `status`: exact codes beat wildcards.
    pub fn status_match(&self, status: StatusCode) -> Option<u8> {
        match self {
            ErrorKey::Code(code) if *code == status.as_u16() => Some(2),
            ErrorKey::ClientErrors if status.is_client_error() => Some(1),
            ErrorKey::ServerErrors if status.is_server_error() => Some(1),
            _ => None,
        }
    }
}

impl FromStr for ErrorKey {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        match s {
            "" => Err(ValidationError::EmptyErrorPage(s.to_string())),
            "4xx" => Ok(ErrorKey::ClientErrors),
            "5xx" => Ok(ErrorKey::ServerErrors),
            _ => Ok(match s.parse::<u16>() {
                Ok(code) => ErrorKey::Code(code),
                Err(_) => ErrorKey::Exception(s.to_string()),
            }),
        }
    }
}

impl fmt::Display for ErrorKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorKey::Code(code) => write!(f, "{code}"),
            ErrorKey::ClientErrors => f.write_str("4xx"),
            ErrorKey::ServerErrors => f.write_str("5xx"),
            ErrorKey::Exception(kind) => f.write_str(kind),
        }
    }
}

/// Kind-specific part of an element.
#[derive(Debug, Clone)]
pub enum ElementDetails {
    Servlet {
        source: ElementSource<dyn Servlet>,
    },
    Filter {
        source: ElementSource<dyn Filter>,
        servlet_names: Vec<String>,
        /// Preprocessors are server-wide and run before security handling.
        preprocessor: bool,
    },
    Listener {
        source: ElementSource<dyn ContextListener>,
    },
    /// Served by the built-in resource servlet: the path within the servlet is appended to
    /// `prefix` and looked up through the context's resource capability.
    Resource {
        prefix: String,
    },
    ErrorPage {
        errors: Vec<ErrorKey>,
        location: String,
    },
    WelcomeFile {
        files: Vec<String>,
        redirect: bool,
    },
}

impl ElementDetails {
    pub fn kind(&self) -> ElementKind {
        match self {
            ElementDetails::Servlet { .. } => ElementKind::Servlet,
            ElementDetails::Filter { .. } => ElementKind::Filter,
            ElementDetails::Listener { .. } => ElementKind::Listener,
            ElementDetails::Resource { .. } => ElementKind::Resource,
            ElementDetails::ErrorPage { .. } => ElementKind::ErrorPage,
            ElementDetails::WelcomeFile { .. } => ElementKind::WelcomeFile,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ElementModel {
    id: ElementId,
    name: String,
    patterns: Patterns,
    targets: Vec<ContextId>,
    rank: i32,
    service_id: u64,
    dynamic: bool,
    owner: Option<ModuleHandle>,
    init_params: BTreeMap<String, String>,
    details: ElementDetails,
}

/// Ordering key between competing elements; the smaller key wins.
///
/// Dynamic registrations come first, then higher rank, then lower (older) service id, and the
/// element id settles anything left.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TieBreakKey {
    dynamic: std::cmp::Reverse<bool>,
    rank: std::cmp::Reverse<i32>,
    service_id: u64,
    seq: ElementId,
}

impl ElementModel {
    pub fn builder(kind: ElementKind) -> ElementBuilder {
        ElementBuilder::new(kind)
    }

    pub fn id(&self) -> ElementId {
        self.id
    }

    pub fn kind(&self) -> ElementKind {
        self.details.kind()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn patterns(&self) -> &Patterns {
        &self.patterns
    }

    pub fn target_contexts(&self) -> &[ContextId] {
        &self.targets
    }

    pub fn rank(&self) -> i32 {
        self.rank
    }

    pub fn service_id(&self) -> u64 {
        self.service_id
    }

    pub fn is_dynamic(&self) -> bool {
        self.dynamic
    }

    pub fn owner(&self) -> Option<&ModuleHandle> {
        self.owner.as_ref()
    }

    pub fn init_params(&self) -> &BTreeMap<String, String> {
        &self.init_params
    }

    pub fn details(&self) -> &ElementDetails {
        &self.details
    }

    pub fn tie_break_key(&self) -> TieBreakKey {
        TieBreakKey {
            dynamic: std::cmp::Reverse(self.dynamic),
            rank: std::cmp::Reverse(self.rank),
            service_id: self.service_id,
            seq: self.id,
        }
    }

    /// Best match of `path` (relative to the context) against the element's patterns.
    pub fn match_path(&self, path: &str) -> Option<PatternMatch> {
        self.patterns.best_match(path)
    }

    pub fn matches(&self, path: &str) -> bool {
        self.match_path(path).is_some()
    }

    pub fn is_preprocessor(&self) -> bool {
        matches!(
            self.details,
            ElementDetails::Filter {
                preprocessor: true,
                ..
            }
        )
    }

    /// Class reference of the element's source, for adapters that need to check it up front.
    pub fn class_name(&self) -> Option<&str> {
        match &self.details {
            ElementDetails::Servlet { source } => source.class_name(),
            ElementDetails::Filter { source, .. } => source.class_name(),
            ElementDetails::Listener { source } => source.class_name(),
            _ => None,
        }
    }

    pub fn add_target_context(&mut self, context: ContextId) {
        if !self.targets.contains(&context) {
            self.targets.push(context);
        }
    }

    /// The same element (same id) bound to other contexts.
    pub fn with_targets(&self, targets: Vec<ContextId>) -> Self {
        let mut element = self.clone();
        element.targets = Vec::new();
        for target in targets {
            element.add_target_context(target);
        }
        element
    }
}

impl fmt::Display for ElementModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {:?} {}", self.kind(), self.name, self.id)
    }
}

/// Any of the three collaborator sources, checked against the element kind at build time.
#[derive(Debug, Clone)]
pub enum AnySource {
    Servlet(ElementSource<dyn Servlet>),
    Filter(ElementSource<dyn Filter>),
    Listener(ElementSource<dyn ContextListener>),
}

impl From<ElementSource<dyn Servlet>> for AnySource {
    fn from(source: ElementSource<dyn Servlet>) -> Self {
        AnySource::Servlet(source)
    }
}

impl From<ElementSource<dyn Filter>> for AnySource {
    fn from(source: ElementSource<dyn Filter>) -> Self {
        AnySource::Filter(source)
    }
}

impl From<ElementSource<dyn ContextListener>> for AnySource {
    fn from(source: ElementSource<dyn ContextListener>) -> Self {
        AnySource::Listener(source)
    }
}

#[derive(Debug)]
pub struct ElementBuilder {
    kind: ElementKind,
    name: Option<String>,
    source: Option<AnySource>,
    url_patterns: Vec<String>,
    regex_patterns: Vec<String>,
    targets: Vec<ContextId>,
    rank: i32,
    service_id: u64,
    dynamic: bool,
    owner: Option<ModuleHandle>,
    init_params: BTreeMap<String, String>,
    servlet_names: Vec<String>,
    preprocessor: bool,
    prefix: String,
    errors: Vec<String>,
    location: Option<String>,
    files: Vec<String>,
    redirect: bool,
}

impl ElementBuilder {
    fn new(kind: ElementKind) -> Self {
        Self {
            kind,
            name: None,
            source: None,
            url_patterns: Vec::new(),
            regex_patterns: Vec::new(),
            targets: Vec::new(),
            rank: 0,
            service_id: 0,
            dynamic: false,
            owner: None,
            init_params: BTreeMap::new(),
            servlet_names: Vec::new(),
            preprocessor: false,
            prefix: String::new(),
            errors: Vec::new(),
            location: None,
            files: Vec::new(),
            redirect: false,
        }
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn source(mut self, source: impl Into<AnySource>) -> Self {
        self.source = Some(source.into());
        self
    }

    pub fn servlet(self, servlet: Arc<dyn Servlet>) -> Self {
        self.source(ElementSource::instance(servlet))
    }

    pub fn filter(self, filter: Arc<dyn Filter>) -> Self {
        self.source(ElementSource::instance(filter))
    }

    pub fn listener(self, listener: Arc<dyn ContextListener>) -> Self {
        self.source(ElementSource::instance(listener))
    }

    pub fn url_pattern(mut self, pattern: impl Into<String>) -> Self {
        self.url_patterns.push(pattern.into());
        self
    }

    pub fn url_patterns<I, S>(mut self, patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.url_patterns.extend(patterns.into_iter().map(Into::into));
        self
    }

    pub fn regex_patterns<I, S>(mut self, patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.regex_patterns
            .extend(patterns.into_iter().map(Into::into));
        self
    }

    pub fn target_context(mut self, context: impl Into<ContextId>) -> Self {
        self.targets.push(context.into());
        self
    }

    pub fn rank(mut self, rank: i32) -> Self {
        self.rank = rank;
        self
    }

    pub fn service_id(mut self, service_id: u64) -> Self {
        self.service_id = service_id;
        self
    }

    pub fn dynamic(mut self, dynamic: bool) -> Self {
        self.dynamic = dynamic;
        self
    }

    pub fn owner(mut self, owner: ModuleHandle) -> Self {
        self.owner = Some(owner);
        self
    }

    pub fn init_param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.init_params.insert(key.into(), value.into());
        self
    }

    pub fn servlet_name(mut self, name: impl Into<String>) -> Self {
        self.servlet_names.push(name.into());
        self
    }

    pub fn preprocessor(mut self, preprocessor: bool) -> Self {
        self.preprocessor = preprocessor;
        self
    }

    pub fn prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    /// An error code (`404`), a wildcard (`4xx`, `5xx`) or an error kind.
    pub fn error(mut self, error: impl Into<String>) -> Self {
        self.errors.push(error.into());
        self
    }

    pub fn location(mut self, location: impl Into<String>) -> Self {
        self.location = Some(location.into());
        self
    }

    pub fn welcome_file(mut self, file: impl Into<String>) -> Self {
        self.files.push(file.into());
        self
    }

    pub fn redirect(mut self, redirect: bool) -> Self {
        self.redirect = redirect;
        self
    }

    pub fn build(self) -> Result<ElementModel, ValidationError> {
        let name = match self.name {
            Some(name) if !name.trim().is_empty() => name,
            _ => return Err(ValidationError::MissingName),
        };
        if !self.url_patterns.is_empty() && !self.regex_patterns.is_empty() {
            return Err(ValidationError::ConflictingPatternTypes(name));
        }
        let patterns = if self.regex_patterns.is_empty() {
            Patterns::parse_urls(&name, &self.url_patterns)?
        } else {
            Patterns::parse_regexes(&name, &self.regex_patterns)?
        };

        let mismatch = |name: &str| ValidationError::SourceKindMismatch {
            name: name.to_string(),
            kind: self.kind.to_string(),
        };
        let details = match self.kind {
            ElementKind::Servlet => match self.source {
                Some(AnySource::Servlet(source)) => ElementDetails::Servlet { source },
                Some(_) => return Err(mismatch(&name)),
                None => return Err(ValidationError::MissingSource(name)),
            },
            ElementKind::Filter => match self.source {
                Some(AnySource::Filter(source)) => {
                    if patterns.is_empty() && self.servlet_names.is_empty() && !self.preprocessor
                    {
                        return Err(ValidationError::MissingMapping(name));
                    }
                    ElementDetails::Filter {
                        source,
                        servlet_names: self.servlet_names,
                        preprocessor: self.preprocessor,
                    }
                }
                Some(_) => return Err(mismatch(&name)),
                None => return Err(ValidationError::MissingSource(name)),
            },
            ElementKind::Listener => match self.source {
                Some(AnySource::Listener(source)) => ElementDetails::Listener { source },
                Some(_) => return Err(mismatch(&name)),
                None => return Err(ValidationError::MissingSource(name)),
            },
            ElementKind::Resource => {
                if self.source.is_some() {
                    return Err(mismatch(&name));
                }
                ElementDetails::Resource {
                    prefix: self.prefix.trim_end_matches('/').to_string(),
                }
            }
            ElementKind::ErrorPage => {
                let location = match self.location {
                    Some(location) if !self.errors.is_empty() => location,
                    _ => return Err(ValidationError::EmptyErrorPage(name)),
                };
                let errors = self
                    .errors
                    .iter()
                    .map(|e| e.parse::<ErrorKey>())
                    .collect::<Result<Vec<_>, _>>()
                    .map_err(|_| ValidationError::EmptyErrorPage(name.clone()))?;
                ElementDetails::ErrorPage { errors, location }
            }
            ElementKind::WelcomeFile => ElementDetails::WelcomeFile {
                files: self
                    .files
                    .into_iter()
                    .map(|f| f.trim_start_matches('/').to_string())
                    .filter(|f| !f.is_empty())
                    .collect(),
                redirect: self.redirect,
            },
        };

        let mut element = ElementModel {
            id: ElementId::next(),
            name,
            patterns,
            targets: Vec::new(),
            rank: self.rank,
            service_id: self.service_id,
            dynamic: self.dynamic,
            owner: self.owner,
            init_params: self.init_params,
            details,
        };
        for target in self.targets {
            element.add_target_context(target);
        }
        Ok(element)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        http::{FilterChain, WebRequest, WebResponse},
        ServletError,
    };

    struct Nop;

    impl Servlet for Nop {
        fn service(&self, _: &mut WebRequest, _: &mut WebResponse) -> Result<(), ServletError> {
            Ok(())
        }
    }

    impl Filter for Nop {
        fn do_filter(
            &self,
            req: &mut WebRequest,
            resp: &mut WebResponse,
            chain: FilterChain<'_>,
        ) -> Result<(), ServletError> {
            chain.proceed(req, resp)
        }
    }

    #[test]
    fn test_builder_validation() {
        assert_eq!(
            ValidationError::MissingName,
            ElementModel::builder(ElementKind::Servlet)
                .servlet(Arc::new(Nop))
                .build()
                .unwrap_err()
        );
        assert_eq!(
            ValidationError::MissingSource("s".to_string()),
            ElementModel::builder(ElementKind::Servlet)
                .name("s")
                .build()
                .unwrap_err()
        );
        assert_eq!(
            ValidationError::ConflictingPatternTypes("s".to_string()),
            ElementModel::builder(ElementKind::Servlet)
                .name("s")
                .servlet(Arc::new(Nop))
                .url_pattern("/a")
                .regex_patterns(["^/b$"])
                .build()
                .unwrap_err()
        );
        assert!(matches!(
            ElementModel::builder(ElementKind::Servlet)
                .name("s")
                .filter(Arc::new(Nop))
                .build(),
            Err(ValidationError::SourceKindMismatch { .. })
        ));
        assert_eq!(
            ValidationError::MissingMapping("f".to_string()),
            ElementModel::builder(ElementKind::Filter)
                .name("f")
                .filter(Arc::new(Nop))
                .build()
                .unwrap_err()
        );
        assert_eq!(
            ValidationError::EmptyErrorPage("e".to_string()),
            ElementModel::builder(ElementKind::ErrorPage)
                .name("e")
                .location("/error")
                .build()
                .unwrap_err()
        );
    }

    #[test]
    fn test_zero_targets_is_legal() {
        let element = ElementModel::builder(ElementKind::Servlet)
            .name("s")
            .servlet(Arc::new(Nop))
            .url_pattern("/s")
            .build()
            .unwrap();
        assert!(element.target_contexts().is_empty());
        assert!(element.matches("/s"));
        assert!(!element.matches("/t"));
    }

    #[test]
    fn test_targets_are_an_ordered_set() {
        let element = ElementModel::builder(ElementKind::Servlet)
            .name("s")
            .servlet(Arc::new(Nop))
            .target_context("c2")
            .target_context("c1")
            .target_context("c2")
            .build()
            .unwrap();
        assert_eq!(
            vec![ContextId::from("c2"), ContextId::from("c1")],
            element.target_contexts()
        );
        let moved = element.with_targets(vec!["c3".into()]);
        assert_eq!(element.id(), moved.id());
        assert_eq!(vec![ContextId::from("c3")], moved.target_contexts());
    }

    #[test]
    fn test_tie_break_key_ordering() {
        let build = |rank: i32, service_id: u64, dynamic: bool| {
            ElementModel::builder(ElementKind::Servlet)
                .name("s")
                .servlet(Arc::new(Nop))
                .rank(rank)
                .service_id(service_id)
                .dynamic(dynamic)
                .build()
                .unwrap()
        };
        let old = build(0, 1, false);
        let young = build(0, 2, false);
        let ranked = build(5, 3, false);
        let dynamic = build(-10, 9, true);
        assert!(old.tie_break_key() < young.tie_break_key());
        assert!(ranked.tie_break_key() < old.tie_break_key());
        assert!(dynamic.tie_break_key() < ranked.tie_break_key());

        // same rank and service id: build order decides
        let first = build(0, 7, false);
        let second = build(0, 7, false);
        assert!(first.tie_break_key() < second.tie_break_key());
    }

    #[test]
    fn test_error_keys() {
        assert_eq!(ErrorKey::Code(404), "404".parse().unwrap());
        assert_eq!(ErrorKey::ClientErrors, "4xx".parse().unwrap());
        assert_eq!(
            ErrorKey::Exception("io".to_string()),
            "io".parse().unwrap()
        );
        assert_eq!(Some(2), ErrorKey::Code(404).status_match(StatusCode::NOT_FOUND));
        assert_eq!(
            Some(1),
            ErrorKey::ClientErrors.status_match(StatusCode::NOT_FOUND)
        );
        assert_eq!(None, ErrorKey::ServerErrors.status_match(StatusCode::NOT_FOUND));
    }
}
