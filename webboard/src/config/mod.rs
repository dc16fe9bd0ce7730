use std::{
    collections::{BTreeMap, BTreeSet},
    path::{Path, PathBuf},
    sync::Arc,
};

use serde::{de::DeserializeOwned, Deserialize};
use webboard_core::{
    config::ServerConfig,
    context::{
        ContextId, DefaultContextHelper, LogicalContext, RequiredHeader, SessionConfig,
    },
    element::{ElementBuilder, ElementKind, ElementModel, ElementSource},
    http::{ContextListener, Filter, Servlet},
    ConfigError, ValidationError,
};

pub mod manager;

/// The operator's config file.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    /// Path of the JSON inspection servlet in the default context. Only read at startup.
    #[serde(default)]
    pub inspect: Option<String>,
    #[serde(default)]
    pub contexts: Vec<ContextDecl>,
    #[serde(default)]
    pub servlets: Vec<ServletDecl>,
    #[serde(default)]
    pub filters: Vec<FilterDecl>,
    #[serde(default)]
    pub listeners: Vec<ListenerDecl>,
    #[serde(default)]
    pub resources: Vec<ResourceDecl>,
    #[serde(default)]
    pub welcome_files: Vec<WelcomeFileDecl>,
    #[serde(default)]
    pub error_pages: Vec<ErrorPageDecl>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ContextDecl {
    pub name: String,
    pub path: String,
    #[serde(default)]
    pub rank: i32,
    #[serde(default)]
    pub init_params: BTreeMap<String, String>,
    /// Directory resources of the context are served from.
    #[serde(default)]
    pub resource_base: Option<PathBuf>,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub required_header: Option<HeaderRule>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct HeaderRule {
    pub name: String,
    #[serde(default)]
    pub value: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ServletDecl {
    pub name: String,
    pub class: String,
    #[serde(default)]
    pub url_patterns: Vec<String>,
    #[serde(default)]
    pub regex_patterns: Vec<String>,
    #[serde(default)]
    pub contexts: Vec<String>,
    #[serde(default)]
    pub rank: i32,
    #[serde(default)]
    pub init_params: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct FilterDecl {
    pub name: String,
    pub class: String,
    #[serde(default)]
    pub url_patterns: Vec<String>,
    #[serde(default)]
    pub regex_patterns: Vec<String>,
    #[serde(default)]
    pub servlet_names: Vec<String>,
    #[serde(default)]
    pub preprocessor: bool,
    #[serde(default)]
    pub contexts: Vec<String>,
    #[serde(default)]
    pub rank: i32,
    #[serde(default)]
    pub init_params: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ListenerDecl {
    pub name: String,
    pub class: String,
    #[serde(default)]
    pub contexts: Vec<String>,
    #[serde(default)]
    pub rank: i32,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ResourceDecl {
    pub name: String,
    pub url_patterns: Vec<String>,
    #[serde(default)]
    pub prefix: String,
    #[serde(default)]
    pub contexts: Vec<String>,
    #[serde(default)]
    pub rank: i32,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct WelcomeFileDecl {
    pub name: String,
    pub files: Vec<String>,
    #[serde(default)]
    pub redirect: bool,
    #[serde(default)]
    pub contexts: Vec<String>,
    #[serde(default)]
    pub rank: i32,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ErrorPageDecl {
    pub name: String,
    /// Status codes, `4xx`/`5xx`, or exception kinds.
    pub errors: Vec<String>,
    pub location: String,
    #[serde(default)]
    pub contexts: Vec<String>,
    #[serde(default)]
    pub rank: i32,
}

/// One declared element, whichever section it came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ElementDecl {
    Servlet(ServletDecl),
    Filter(FilterDecl),
    Listener(ListenerDecl),
    Resource(ResourceDecl),
    WelcomeFile(WelcomeFileDecl),
    ErrorPage(ErrorPageDecl),
}

impl ElementDecl {
    pub fn kind(&self) -> ElementKind {
        match self {
            ElementDecl::Servlet(_) => ElementKind::Servlet,
            ElementDecl::Filter(_) => ElementKind::Filter,
            ElementDecl::Listener(_) => ElementKind::Listener,
            ElementDecl::Resource(_) => ElementKind::Resource,
            ElementDecl::WelcomeFile(_) => ElementKind::WelcomeFile,
            ElementDecl::ErrorPage(_) => ElementKind::ErrorPage,
        }
    }

    fn common(&self) -> (&str, &[String], i32) {
        match self {
            ElementDecl::Servlet(d) => (&d.name, &d.contexts, d.rank),
            ElementDecl::Filter(d) => (&d.name, &d.contexts, d.rank),
            ElementDecl::Listener(d) => (&d.name, &d.contexts, d.rank),
            ElementDecl::Resource(d) => (&d.name, &d.contexts, d.rank),
            ElementDecl::WelcomeFile(d) => (&d.name, &d.contexts, d.rank),
            ElementDecl::ErrorPage(d) => (&d.name, &d.contexts, d.rank),
        }
    }

    /// Unique within one config: names only clash within a section.
    pub fn key(&self) -> String {
        format!("{}/{}", self.kind(), self.common().0)
    }

    pub fn contexts(&self) -> &[String] {
        self.common().1
    }

    pub fn build(&self, service_id: u64) -> Result<ElementModel, ValidationError> {
        let (name, contexts, rank) = self.common();
        let mut builder = ElementModel::builder(self.kind())
            .name(name)
            .rank(rank)
            .service_id(service_id);
        for context in contexts {
            builder = builder.target_context(context.as_str());
        }
        builder = match self {
            ElementDecl::Servlet(d) => with_params(
                builder
                    .source(ElementSource::<dyn Servlet>::class(&d.class))
                    .url_patterns(&d.url_patterns)
                    .regex_patterns(&d.regex_patterns),
                &d.init_params,
            ),
            ElementDecl::Filter(d) => {
                let mut builder = builder
                    .source(ElementSource::<dyn Filter>::class(&d.class))
                    .url_patterns(&d.url_patterns)
                    .regex_patterns(&d.regex_patterns)
                    .preprocessor(d.preprocessor);
                for servlet in &d.servlet_names {
                    builder = builder.servlet_name(servlet);
                }
                with_params(builder, &d.init_params)
            }
            ElementDecl::Listener(d) => {
                builder.source(ElementSource::<dyn ContextListener>::class(&d.class))
            }
            ElementDecl::Resource(d) => builder.url_patterns(&d.url_patterns).prefix(&d.prefix),
            ElementDecl::WelcomeFile(d) => {
                let mut builder = builder.redirect(d.redirect);
                for file in &d.files {
                    builder = builder.welcome_file(file);
                }
                builder
            }
            ElementDecl::ErrorPage(d) => {
                let mut builder = builder.location(&d.location);
                for error in &d.errors {
                    builder = builder.error(error);
                }
                builder
            }
        };
        builder.build()
    }
}

fn with_params(mut builder: ElementBuilder, params: &BTreeMap<String, String>) -> ElementBuilder {
    for (key, value) in params {
        builder = builder.init_param(key, value);
    }
    builder
}

impl ContextDecl {
    pub fn build(&self) -> Result<LogicalContext, ValidationError> {
        let required_header = self.required_header.as_ref().map(|rule| RequiredHeader {
            name: rule.name.clone(),
            value: rule.value.clone(),
        });
        let helper = DefaultContextHelper::new(self.resource_base.clone(), required_header);
        let mut context = LogicalContext::new(self.name.as_str(), &self.path)?
            .with_rank(self.rank)
            .with_helper(Arc::new(helper))
            .with_session(self.session.clone());
        for (key, value) in &self.init_params {
            context = context.with_init_param(key, value);
        }
        Ok(context)
    }

    /// Same declaration apart from the rank.
    pub fn same_but_rank(&self, other: &ContextDecl) -> bool {
        ContextDecl {
            rank: other.rank,
            ..self.clone()
        } == *other
    }
}

/// The validated contents of a config, keyed for diffing.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Declared {
    pub contexts: BTreeMap<String, ContextDecl>,
    pub elements: BTreeMap<String, ElementDecl>,
}

impl Config {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = webboard_core::util::file_read_sync(path)?;
        Self::parse(&content)
    }

    pub fn parse(content: &[u8]) -> Result<Self, ConfigError> {
        parse_from_slice(content)
    }

    /// Checks names and context references and keys everything for diffing.
    pub fn declared(&self) -> Result<Declared, ConfigError> {
        let mut declared = Declared::default();
        for context in &self.contexts {
            context.build()?;
            if context.name == self.server.default_context {
                let id = ContextId::new(&context.name);
                return Err(ValidationError::DuplicateContext(id).into());
            }
            if declared
                .contexts
                .insert(context.name.clone(), context.clone())
                .is_some()
            {
                return Err(ConfigError::Duplicate(format!("context {}", context.name)));
            }
        }

        let known: BTreeSet<&str> = declared
            .contexts
            .keys()
            .map(String::as_str)
            .chain([self.server.default_context.as_str()])
            .collect();
        let elements = (self.servlets.iter().cloned().map(ElementDecl::Servlet))
            .chain(self.filters.iter().cloned().map(ElementDecl::Filter))
            .chain(self.listeners.iter().cloned().map(ElementDecl::Listener))
            .chain(self.resources.iter().cloned().map(ElementDecl::Resource))
            .chain(self.welcome_files.iter().cloned().map(ElementDecl::WelcomeFile))
            .chain(self.error_pages.iter().cloned().map(ElementDecl::ErrorPage));
        for element in elements {
            element.build(0)?;
            let contexts = element.contexts();
            if let Some(missing) = contexts.iter().find(|c| !known.contains(c.as_str())) {
                return Err(ValidationError::UnknownContext(ContextId::new(missing)).into());
            }
            let key = element.key();
            if declared.elements.insert(key.clone(), element).is_some() {
                return Err(ConfigError::Duplicate(key));
            }
        }
        Ok(declared)
    }
}

pub fn parse_from_slice<T: DeserializeOwned>(content: &[u8]) -> Result<T, ConfigError> {
    // read first non-space u8
    let is_json = match content
        .iter()
        .find(|&&b| b != b' ' && b != b'\r' && b != b'\n' && b != b'\t')
    {
        Some(first) => *first == b'{',
        None => false,
    };
    match is_json {
        true => {
            serde_json::from_slice::<T>(content).map_err(|e| ConfigError::Parse(e.to_string()))
        }
        false => toml::from_str::<T>(&String::from_utf8_lossy(content))
            .map_err(|e| ConfigError::Parse(e.to_string())),
    }
}
