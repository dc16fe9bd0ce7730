use std::{collections::BTreeMap, sync::Arc};

use parking_lot::Mutex;
use tracing::info;

use crate::{
    context::{ContextId, ModuleHandle},
    element::{ElementBuilder, ElementId, ElementKind, ElementModel},
    http::Servlet,
    server::{Batch, Change, WebServer},
    RegistrationError, ValidationError,
};

#[derive(Debug, Clone)]
struct Alias {
    module: ModuleHandle,
    element: ElementId,
}

/// Alias based registration of servlets and resources.
///
/// Registrations made here are dynamic: they take precedence over any whiteboard registration
/// competing for the same name or URL pattern. Aliases form one namespace per server.
pub struct DirectRegistrations {
    server: Arc<WebServer>,
    aliases: Mutex<BTreeMap<String, Alias>>,
}

impl DirectRegistrations {
    pub fn new(server: Arc<WebServer>) -> Self {
        Self {
            server,
            aliases: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn register_servlet(
        &self,
        module: &ModuleHandle,
        alias: &str,
        servlet: Arc<dyn Servlet>,
        init_params: BTreeMap<String, String>,
        context: Option<ContextId>,
    ) -> Result<ElementId, RegistrationError> {
        let mut builder = ElementModel::builder(ElementKind::Servlet).servlet(servlet);
        for (key, value) in init_params {
            builder = builder.init_param(key, value);
        }
        self.register(module, alias, builder, context)
    }

    /// Serves `alias` from the resources below `prefix` of the context.
    pub fn register_resources(
        &self,
        module: &ModuleHandle,
        alias: &str,
        prefix: &str,
        context: Option<ContextId>,
    ) -> Result<ElementId, RegistrationError> {
        let builder = ElementModel::builder(ElementKind::Resource).prefix(prefix);
        self.register(module, alias, builder, context)
    }

    pub fn unregister(&self, module: &ModuleHandle, alias: &str) -> Result<(), RegistrationError> {
        let mut aliases = self.aliases.lock();
        let element = match aliases.get(alias) {
            Some(registered) if &registered.module == module => registered.element,
            _ => return Err(ValidationError::UnknownAlias(alias.to_string()).into()),
        };
        self.server.submit(
            Batch::new(format!("unregister alias {alias}")).with(Change::RemoveElement(element)),
        )?;
        aliases.remove(alias);
        Ok(())
    }

    /// Drops every alias of a stopped module.
    pub fn unregister_all(&self, module: &ModuleHandle) -> Result<(), RegistrationError> {
        let mut aliases = self.aliases.lock();
        let owned: Vec<String> = aliases
            .iter()
            .filter(|(_, registered)| &registered.module == module)
            .map(|(alias, _)| alias.clone())
            .collect();
        if owned.is_empty() {
            return Ok(());
        }
        let mut batch = Batch::new(format!("unregister aliases of {module}"));
        for alias in &owned {
            batch.add(Change::RemoveElement(aliases[alias].element));
        }
        self.server.submit(batch)?;
        for alias in owned {
            aliases.remove(&alias);
        }
        Ok(())
    }

    pub fn aliases(&self) -> Vec<String> {
        self.aliases.lock().keys().cloned().collect()
    }

    fn register(
        &self,
        module: &ModuleHandle,
        alias: &str,
        builder: ElementBuilder,
        context: Option<ContextId>,
    ) -> Result<ElementId, RegistrationError> {
        check_alias(alias)?;
        let mut aliases = self.aliases.lock();
        if aliases.contains_key(alias) {
            return Err(ValidationError::AliasInUse(alias.to_string()).into());
        }

        let mut builder = builder
            .name(alias)
            .url_patterns(alias_patterns(alias))
            .dynamic(true)
            .service_id(self.server.next_service_id())
            .owner(module.clone());
        if let Some(context) = context {
            builder = builder.target_context(context);
        }
        let element = builder.build()?;
        let id = element.id();
        self.server.submit(
            Batch::new(format!("register alias {alias}")).with(Change::add_element(element)),
        )?;
        info!(%alias, %module, "alias registered");
        aliases.insert(
            alias.to_string(),
            Alias {
                module: module.clone(),
                element: id,
            },
        );
        Ok(id)
    }
}

fn check_alias(alias: &str) -> Result<(), ValidationError> {
    let valid = alias == "/" || (alias.starts_with('/') && !alias.ends_with('/'));
    if valid && !alias.contains('*') {
        Ok(())
    } else {
        Err(ValidationError::InvalidPattern(alias.to_string()))
    }
}

/// The root alias covers everything; any other alias covers itself and what lies below it.
fn alias_patterns(alias: &str) -> Vec<String> {
    if alias == "/" {
        vec!["/*".to_string()]
    } else {
        vec![alias.to_string(), format!("{alias}/*")]
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use http::{Request, StatusCode};

    use super::*;
    use crate::{
        config::ServerConfig,
        context::{DefaultContextHelper, LogicalContext},
        element::ClassRegistry,
        engine::NullEngine,
        http::{WebRequest, WebResponse},
        ServletError,
    };

    struct Tagged(&'static str);

    impl Servlet for Tagged {
        fn service(&self, req: &mut WebRequest, resp: &mut WebResponse) -> Result<(), ServletError> {
            resp.write(format!("{}:{}", self.0, req.path_info().unwrap_or("-")).as_bytes());
            Ok(())
        }
    }

    fn direct() -> DirectRegistrations {
        let server = WebServer::new(
            ServerConfig::default(),
            Arc::new(NullEngine),
            Arc::new(ClassRegistry::default()),
        );
        server.start().unwrap();
        DirectRegistrations::new(Arc::new(server))
    }

    fn get(direct: &DirectRegistrations, path: &str) -> (StatusCode, String) {
        let request = Request::get(path).body(Bytes::new()).unwrap();
        let dispatched = direct.server.dispatch(request).unwrap();
        let body = String::from_utf8(dispatched.response.body().to_vec()).unwrap();
        (dispatched.response.status(), body)
    }

    #[test]
    fn test_alias_patterns() {
        assert_eq!(vec!["/*"], alias_patterns("/"));
        assert_eq!(vec!["/hello", "/hello/*"], alias_patterns("/hello"));
        assert!(check_alias("/hello/").is_err());
        assert!(check_alias("hello").is_err());
        assert!(check_alias("/*.do").is_err());
    }

    #[test]
    fn test_register_and_unregister_servlet() {
        let direct = direct();
        let module = ModuleHandle::new(1, "app");
        direct
            .register_servlet(&module, "/hello", Arc::new(Tagged("hi")), BTreeMap::new(), None)
            .unwrap();
        assert_eq!((StatusCode::OK, "hi:-".to_string()), get(&direct, "/hello"));
        assert_eq!((StatusCode::OK, "hi:/x".to_string()), get(&direct, "/hello/x"));

        let err = direct
            .register_servlet(&module, "/hello", Arc::new(Tagged("again")), BTreeMap::new(), None)
            .unwrap_err();
        assert!(matches!(
            err,
            RegistrationError::Validation(ValidationError::AliasInUse(_))
        ));

        let other = ModuleHandle::new(2, "other");
        assert!(matches!(
            direct.unregister(&other, "/hello"),
            Err(RegistrationError::Validation(ValidationError::UnknownAlias(_)))
        ));
        direct.unregister(&module, "/hello").unwrap();
        assert_eq!(StatusCode::NOT_FOUND, get(&direct, "/hello").0);
        assert!(direct.aliases().is_empty());
    }

    #[test]
    fn test_direct_registration_beats_whiteboard() {
        let direct = direct();
        let declared = ElementModel::builder(ElementKind::Servlet)
            .name("declared")
            .servlet(Arc::new(Tagged("declared")))
            .url_pattern("/hello")
            .rank(100)
            .service_id(1)
            .build()
            .unwrap();
        let declared_id = declared.id();
        direct
            .server
            .submit(Batch::new("declared").with(Change::add_element(declared)))
            .unwrap();

        let module = ModuleHandle::new(1, "app");
        direct
            .register_servlet(&module, "/hello", Arc::new(Tagged("direct")), BTreeMap::new(), None)
            .unwrap();
        assert!(!direct.server.is_enabled(declared_id));
        assert_eq!("direct:-", get(&direct, "/hello").1);

        direct.unregister_all(&module).unwrap();
        assert!(direct.server.is_enabled(declared_id));
    }

    #[test]
    fn test_register_resources() {
        let dir = std::env::temp_dir().join(format!("webboard-direct-{}", std::process::id()));
        std::fs::create_dir_all(dir.join("web")).unwrap();
        std::fs::write(dir.join("web/a.css"), "body{}").unwrap();

        let direct = direct();
        let context = LogicalContext::new("site", "/site")
            .unwrap()
            .with_helper(Arc::new(DefaultContextHelper::new(Some(dir.clone()), None)));
        direct
            .server
            .submit(Batch::new("site").with(Change::AddLogicalContext(context)))
            .unwrap();

        let module = ModuleHandle::new(1, "app");
        direct
            .register_resources(&module, "/static", "/web", Some("site".into()))
            .unwrap();
        assert_eq!((StatusCode::OK, "body{}".to_string()), get(&direct, "/site/static/a.css"));
        assert_eq!(StatusCode::NOT_FOUND, get(&direct, "/site/static/b.css").0);

        std::fs::remove_dir_all(dir).ok();
    }

    #[test]
    fn test_unknown_context_is_rejected() {
        let direct = direct();
        let module = ModuleHandle::new(1, "app");
        let err = direct
            .register_servlet(
                &module,
                "/x",
                Arc::new(Tagged("x")),
                BTreeMap::new(),
                Some("nowhere".into()),
            )
            .unwrap_err();
        assert!(matches!(err, RegistrationError::Batch(_)));
        assert!(direct.aliases().is_empty());
    }
}
