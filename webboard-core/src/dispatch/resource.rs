use http::{header, HeaderValue, Method, StatusCode};

use crate::{
    http::{Servlet, WebRequest, WebResponse},
    util::file_read_sync,
    ServletError,
};

/// Serves resource elements: `prefix` plus the path within the servlet is looked up through
/// the resource capability of the request's context view.
#[derive(Debug, Clone)]
pub struct ResourceServlet {
    prefix: String,
}

impl ResourceServlet {
    pub fn new(prefix: &str) -> Self {
        Self {
            prefix: prefix.to_string(),
        }
    }

    pub fn resource_name(&self, servlet_path: &str, path_info: Option<&str>) -> String {
        format!("{}{}", self.prefix, path_info.unwrap_or(servlet_path))
    }
}

impl Servlet for ResourceServlet {
    fn service(&self, req: &mut WebRequest, resp: &mut WebResponse) -> Result<(), ServletError> {
        let method = req.method().clone();
        if method != Method::GET && method != Method::HEAD {
            resp.send_error(StatusCode::METHOD_NOT_ALLOWED);
            resp.headers_mut()
                .insert(header::ALLOW, HeaderValue::from_static("GET, HEAD"));
            return Ok(());
        }

        let name = self.resource_name(req.servlet_path(), req.path_info());
        let Some(view) = req.view() else {
            resp.send_error(StatusCode::NOT_FOUND);
            return Ok(());
        };
        let Some(file) = view.get_resource(&name) else {
            tracing::debug!(resource = %name, context = %view.context_id(), "resource not found");
            resp.send_error(StatusCode::NOT_FOUND);
            return Ok(());
        };
        let content = file_read_sync(&file)?;
        if let Some(mime) = view
            .get_mime_type(&name)
            .and_then(|m| HeaderValue::from_str(&m).ok())
        {
            resp.headers_mut().insert(header::CONTENT_TYPE, mime);
        }
        resp.headers_mut()
            .insert(header::CONTENT_LENGTH, HeaderValue::from(content.len()));
        if method != Method::HEAD {
            resp.write(&content);
        }
        Ok(())
    }
}
