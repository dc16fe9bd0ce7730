use std::sync::{Arc, Weak};

use http::{header, HeaderValue, Method, StatusCode};
use webboard_core::{
    http::{Servlet, WebRequest, WebResponse},
    server::WebServer,
    ServletError,
};

/// Serves the committed model as JSON, or with `?path=/some/path` what that path resolves to.
#[derive(Debug, Clone)]
pub struct InspectServlet {
    // The servlet is reachable from the server's own routing table.
    server: Weak<WebServer>,
}

impl InspectServlet {
    pub fn new(server: &Arc<WebServer>) -> Self {
        Self {
            server: Arc::downgrade(server),
        }
    }
}

impl Servlet for InspectServlet {
    fn service(&self, req: &mut WebRequest, resp: &mut WebResponse) -> Result<(), ServletError> {
        if req.method() != Method::GET {
            resp.send_error(StatusCode::METHOD_NOT_ALLOWED);
            return Ok(());
        }
        let Some(server) = self.server.upgrade() else {
            resp.send_error(StatusCode::SERVICE_UNAVAILABLE);
            return Ok(());
        };
        let body = match req.query().and_then(|q| q.strip_prefix("path=")) {
            Some(path) => serde_json::to_vec_pretty(&server.request_info(path)),
            None => serde_json::to_vec_pretty(&server.model_snapshot()),
        }
        .map_err(|e| ServletError::with_kind("serialization", e.to_string()))?;
        resp.headers_mut().insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("application/json"),
        );
        resp.write(&body);
        Ok(())
    }
}
