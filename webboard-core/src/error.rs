use thiserror::Error;

use crate::{context::ContextId, element::ElementId};

pub type AnyError = anyhow::Error;
pub type AnyResult<T> = std::result::Result<T, AnyError>;

/// A malformed registration or an operation that does not fit the current model.
///
/// Validation errors are raised before anything enters the model.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("element name is missing")]
    MissingName,
    #[error("element {0} has no instance, class reference or supplier")]
    MissingSource(String),
    #[error("element {name} is a {kind} but its source provides a different kind")]
    SourceKindMismatch { name: String, kind: String },
    #[error("filter {0} maps no url pattern, regex pattern or servlet name")]
    MissingMapping(String),
    #[error("element {0} sets both url patterns and regex patterns")]
    ConflictingPatternTypes(String),
    #[error("element {name} declares url pattern {pattern} twice")]
    DuplicatePattern { name: String, pattern: String },
    #[error("invalid url pattern {0:?}")]
    InvalidPattern(String),
    #[error("invalid regex pattern {pattern:?}: {reason}")]
    InvalidRegex { pattern: String, reason: String },
    #[error("invalid context path {0:?}")]
    InvalidPath(String),
    #[error("error page {0} maps no error code or exception")]
    EmptyErrorPage(String),
    #[error("logical context {0} already exists")]
    DuplicateContext(ContextId),
    #[error("logical context {0} does not exist")]
    UnknownContext(ContextId),
    #[error("physical context {0} does not exist")]
    UnknownPhysicalContext(String),
    #[error("physical context {path} is still used by logical context {context}")]
    PhysicalContextInUse { path: String, context: ContextId },
    #[error("element {0} already exists")]
    DuplicateElement(ElementId),
    #[error("element {0} does not exist")]
    UnknownElement(ElementId),
    #[error("alias {0} is already registered")]
    AliasInUse(String),
    #[error("alias {0} is not registered by this module")]
    UnknownAlias(String),
}

/// An engine adapter refused to materialize an effect.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("engine {engine} rejected {effect}: {reason}")]
pub struct EngineError {
    pub engine: String,
    pub effect: String,
    pub reason: String,
}

impl EngineError {
    pub fn new(engine: impl Into<String>, effect: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            engine: engine.into(),
            effect: effect.into(),
            reason: reason.into(),
        }
    }
}

#[derive(Error, Debug)]
pub enum BatchError {
    #[error("batch {label:?} rejected at operation #{index} ({op}): {source}")]
    Validation {
        label: String,
        index: usize,
        op: String,
        #[source]
        source: ValidationError,
    },
    #[error("batch {label:?} rolled back: {source}")]
    Engine {
        label: String,
        #[source]
        source: EngineError,
    },
}

impl BatchError {
    pub fn validation_error(&self) -> Option<&ValidationError> {
        match self {
            BatchError::Validation { source, .. } => Some(source),
            BatchError::Engine { .. } => None,
        }
    }
}

/// Failure raised by collaborator code: servlets, filters and listeners.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{message}")]
pub struct ServletError {
    /// Kind used to select an exception-mapped error page, like `"java.io.IOException"` in a
    /// servlet container, or any stable string the application picks.
    pub kind: Option<String>,
    pub message: String,
}

impl ServletError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            kind: None,
            message: message.into(),
        }
    }

    pub fn with_kind(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: Some(kind.into()),
            message: message.into(),
        }
    }
}

impl From<std::io::Error> for ServletError {
    fn from(e: std::io::Error) -> Self {
        Self::with_kind("io", e.to_string())
    }
}

#[derive(Error, Debug)]
pub enum DispatchError {
    #[error("servlet error: {0}")]
    Servlet(#[from] ServletError),
    // to make it Sync, construct a String instead of Box<dyn Any + Send>
    #[error("collaborator panic: {0}")]
    Panic(String),
    #[error("element {0} could not be instantiated: {1}")]
    Instantiation(String, String),
}

/// Failure of a registration made through the direct registration API.
#[derive(Error, Debug)]
pub enum RegistrationError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    Batch(#[from] BatchError),
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("config io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("config parse error: {0}")]
    Parse(String),
    #[error("invalid config: {0}")]
    Invalid(#[from] ValidationError),
    #[error("{0} is declared more than once")]
    Duplicate(String),
}
