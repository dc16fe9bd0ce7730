use tracing::info;
use webboard_core::{context::ScopedView, http::ContextListener};

#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingListener;

impl ContextListener for LoggingListener {
    fn context_initialized(&self, view: &ScopedView) {
        info!(
            context = %view.context_id(),
            path = %view.context_path(),
            module = ?view.module(),
            "context initialized"
        );
    }

    fn context_destroyed(&self, view: &ScopedView) {
        info!(
            context = %view.context_id(),
            path = %view.context_path(),
            "context destroyed"
        );
    }
}
