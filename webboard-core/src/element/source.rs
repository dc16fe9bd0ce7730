use std::{
    collections::HashMap,
    fmt,
    sync::{Arc, OnceLock},
};

use parking_lot::RwLock;

use crate::{
    http::{ContextListener, Filter, Servlet},
    DispatchError, ServletError,
};

type Factory<T> = Arc<dyn Fn() -> Result<Arc<T>, ServletError> + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SupplierScope {
    /// Invoked once, the instance is shared afterwards.
    #[default]
    Singleton,
    /// Invoked for every lookup.
    PerLookup,
}

/// Where an element's instance comes from.
pub enum ElementSource<T: ?Sized> {
    Instance(Arc<T>),
    /// Resolved through the [`ClassRegistry`] on first use.
    Class {
        name: String,
        memo: Arc<OnceLock<Arc<T>>>,
    },
    Supplier {
        scope: SupplierScope,
        factory: Factory<T>,
        memo: Arc<OnceLock<Arc<T>>>,
    },
}

impl<T: ?Sized> ElementSource<T> {
    pub fn instance(instance: Arc<T>) -> Self {
        Self::Instance(instance)
    }

    pub fn class(name: impl Into<String>) -> Self {
        Self::Class {
            name: name.into(),
            memo: Arc::new(OnceLock::new()),
        }
    }

    pub fn supplier<F>(scope: SupplierScope, factory: F) -> Self
    where
        F: Fn() -> Result<Arc<T>, ServletError> + Send + Sync + 'static,
    {
        Self::Supplier {
            scope,
            factory: Arc::new(factory),
            memo: Arc::new(OnceLock::new()),
        }
    }

    pub fn class_name(&self) -> Option<&str> {
        match self {
            Self::Class { name, .. } => Some(name),
            _ => None,
        }
    }

    pub fn describe(&self) -> String {
        match self {
            Self::Instance(_) => "instance".to_string(),
            Self::Class { name, .. } => format!("class {name}"),
            Self::Supplier { scope, .. } => format!("supplier ({scope:?})"),
        }
    }
}

impl<T: ?Sized + Instantiate> ElementSource<T> {
    /// Produces the instance to invoke for one lookup.
    pub fn resolve(&self, registry: &ClassRegistry) -> Result<Arc<T>, DispatchError> {
        match self {
            Self::Instance(instance) => Ok(instance.clone()),
            Self::Class { name, memo } => {
                if let Some(instance) = memo.get() {
                    return Ok(instance.clone());
                }
                let instance = T::instantiate(registry, name).ok_or_else(|| {
                    DispatchError::Instantiation(name.clone(), "class is not registered".into())
                })?;
                Ok(memo.get_or_init(|| instance).clone())
            }
            Self::Supplier {
                scope: SupplierScope::PerLookup,
                factory,
                ..
            } => factory().map_err(|e| DispatchError::Instantiation("supplier".into(), e.message)),
            Self::Supplier {
                scope: SupplierScope::Singleton,
                factory,
                memo,
            } => {
                if let Some(instance) = memo.get() {
                    return Ok(instance.clone());
                }
                let instance = factory()
                    .map_err(|e| DispatchError::Instantiation("supplier".into(), e.message))?;
                Ok(memo.get_or_init(|| instance).clone())
            }
        }
    }
}

impl<T: ?Sized> Clone for ElementSource<T> {
    fn clone(&self) -> Self {
        match self {
            Self::Instance(instance) => Self::Instance(instance.clone()),
            Self::Class { name, memo } => Self::Class {
                name: name.clone(),
                memo: memo.clone(),
            },
            Self::Supplier {
                scope,
                factory,
                memo,
            } => Self::Supplier {
                scope: *scope,
                factory: factory.clone(),
                memo: memo.clone(),
            },
        }
    }
}

impl<T: ?Sized> fmt::Debug for ElementSource<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.describe())
    }
}

type Constructor<T> = Arc<dyn Fn() -> Arc<T> + Send + Sync>;

/// Constructors for class-referenced elements, looked up by class name.
#[derive(Default)]
pub struct ClassRegistry {
    servlets: RwLock<HashMap<String, Constructor<dyn Servlet>>>,
    filters: RwLock<HashMap<String, Constructor<dyn Filter>>>,
    listeners: RwLock<HashMap<String, Constructor<dyn ContextListener>>>,
}

impl ClassRegistry {
    pub fn register_servlet<F>(&self, class: impl Into<String>, constructor: F)
    where
        F: Fn() -> Arc<dyn Servlet> + Send + Sync + 'static,
    {
        self.servlets
            .write()
            .insert(class.into(), Arc::new(constructor));
    }

    pub fn register_filter<F>(&self, class: impl Into<String>, constructor: F)
    where
        F: Fn() -> Arc<dyn Filter> + Send + Sync + 'static,
    {
        self.filters.write().insert(class.into(), Arc::new(constructor));
    }

    pub fn register_listener<F>(&self, class: impl Into<String>, constructor: F)
    where
        F: Fn() -> Arc<dyn ContextListener> + Send + Sync + 'static,
    {
        self.listeners
            .write()
            .insert(class.into(), Arc::new(constructor));
    }

    pub fn contains_servlet(&self, class: &str) -> bool {
        self.servlets.read().contains_key(class)
    }

    pub fn contains_filter(&self, class: &str) -> bool {
        self.filters.read().contains_key(class)
    }

    pub fn contains_listener(&self, class: &str) -> bool {
        self.listeners.read().contains_key(class)
    }
}

impl fmt::Debug for ClassRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClassRegistry")
            .field("servlets", &self.servlets.read().keys().collect::<Vec<_>>())
            .field("filters", &self.filters.read().keys().collect::<Vec<_>>())
            .field("listeners", &self.listeners.read().keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Element types a [`ClassRegistry`] can construct.
pub trait Instantiate {
    fn instantiate(registry: &ClassRegistry, class: &str) -> Option<Arc<Self>>;
}

impl Instantiate for dyn Servlet {
    fn instantiate(registry: &ClassRegistry, class: &str) -> Option<Arc<Self>> {
        let constructor = registry.servlets.read().get(class).cloned()?;
        Some(constructor())
    }
}

impl Instantiate for dyn Filter {
    fn instantiate(registry: &ClassRegistry, class: &str) -> Option<Arc<Self>> {
        let constructor = registry.filters.read().get(class).cloned()?;
        Some(constructor())
    }
}

impl Instantiate for dyn ContextListener {
    fn instantiate(registry: &ClassRegistry, class: &str) -> Option<Arc<Self>> {
        let constructor = registry.listeners.read().get(class).cloned()?;
        Some(constructor())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::http::{WebRequest, WebResponse};

    struct Hello;

    impl Servlet for Hello {
        fn service(&self, _req: &mut WebRequest, resp: &mut WebResponse) -> Result<(), ServletError> {
            resp.write(b"hello");
            Ok(())
        }
    }

    #[test]
    fn test_class_reference_resolution() {
        let registry = ClassRegistry::default();
        let source = ElementSource::<dyn Servlet>::class("hello");
        assert!(matches!(
            source.resolve(&registry),
            Err(DispatchError::Instantiation(..))
        ));

        registry.register_servlet("hello", || Arc::new(Hello) as Arc<dyn Servlet>);
        let first = source.resolve(&registry).unwrap();
        let second = source.clone().resolve(&registry).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn test_supplier_scopes() {
        let calls = Arc::new(AtomicUsize::new(0));
        let registry = ClassRegistry::default();

        let counter = calls.clone();
        let singleton = ElementSource::<dyn Servlet>::supplier(SupplierScope::Singleton, move || {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(Arc::new(Hello) as Arc<dyn Servlet>)
        });
        singleton.resolve(&registry).unwrap();
        singleton.resolve(&registry).unwrap();
        assert_eq!(1, calls.load(Ordering::SeqCst));

        let counter = calls.clone();
        let per_lookup = ElementSource::<dyn Servlet>::supplier(SupplierScope::PerLookup, move || {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(Arc::new(Hello) as Arc<dyn Servlet>)
        });
        per_lookup.resolve(&registry).unwrap();
        per_lookup.resolve(&registry).unwrap();
        assert_eq!(3, calls.load(Ordering::SeqCst));
    }
}
