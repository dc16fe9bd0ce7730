//! Elements that ship with the server, available to configuration by class name.
use std::sync::Arc;

use webboard_core::{
    element::ClassRegistry,
    http::{ContextListener, Filter, Servlet},
};

mod access_log;
mod echo;
mod inspect;
mod listener;

pub use access_log::AccessLogFilter;
pub use echo::EchoServlet;
pub use inspect::InspectServlet;
pub use listener::LoggingListener;

pub const ECHO_SERVLET: &str = "webboard.EchoServlet";
pub const ACCESS_LOG_FILTER: &str = "webboard.AccessLogFilter";
pub const LOGGING_LISTENER: &str = "webboard.LoggingListener";

/// Registers the built-in classes. The inspect servlet needs the server and is not among them.
pub fn register_builtins(registry: &ClassRegistry) {
    registry.register_servlet(ECHO_SERVLET, || Arc::new(EchoServlet) as Arc<dyn Servlet>);
    registry.register_filter(ACCESS_LOG_FILTER, || {
        Arc::new(AccessLogFilter) as Arc<dyn Filter>
    });
    registry.register_listener(LOGGING_LISTENER, || {
        Arc::new(LoggingListener) as Arc<dyn ContextListener>
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_builtins() {
        let registry = ClassRegistry::default();
        register_builtins(&registry);
        assert!(registry.contains_servlet(ECHO_SERVLET));
        assert!(registry.contains_filter(ACCESS_LOG_FILTER));
        assert!(registry.contains_listener(LOGGING_LISTENER));
        assert!(!registry.contains_servlet(ACCESS_LOG_FILTER));
    }
}
