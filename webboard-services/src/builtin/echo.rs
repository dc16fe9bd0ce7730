use std::fmt::Write;

use http::{header, HeaderValue};
use webboard_core::{
    http::{Servlet, WebRequest, WebResponse},
    ServletError,
};

/// Answers with the paths the dispatcher resolved for the request, one `key: value` per line.
#[derive(Debug, Default, Clone, Copy)]
pub struct EchoServlet;

impl Servlet for EchoServlet {
    fn service(&self, req: &mut WebRequest, resp: &mut WebResponse) -> Result<(), ServletError> {
        let mut out = String::new();
        let _ = writeln!(out, "method: {}", req.method());
        let _ = writeln!(out, "path: {}", req.path());
        let _ = writeln!(out, "context_path: {}", req.context_path());
        let _ = writeln!(out, "servlet_path: {}", req.servlet_path());
        let _ = writeln!(out, "path_info: {}", req.path_info().unwrap_or(""));
        if let Some(view) = req.view() {
            let _ = writeln!(out, "context: {}", view.context_id());
        }
        resp.headers_mut().insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("text/plain; charset=utf-8"),
        );
        resp.write(out.as_bytes());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use bytes::Bytes;
    use http::Request;
    use webboard_core::{
        config::ServerConfig,
        element::{ClassRegistry, ElementKind, ElementModel, ElementSource},
        engine::NullEngine,
        server::{Batch, Change, WebServer},
    };

    use super::*;
    use crate::builtin::{register_builtins, ECHO_SERVLET};

    #[test]
    fn test_echo_by_class_name() {
        let registry = Arc::new(ClassRegistry::default());
        register_builtins(&registry);
        let server = WebServer::new(ServerConfig::default(), Arc::new(NullEngine), registry);
        server.start().unwrap();
        let element = ElementModel::builder(ElementKind::Servlet)
            .name("echo")
            .source(ElementSource::<dyn Servlet>::class(ECHO_SERVLET))
            .url_pattern("/echo/*")
            .build()
            .unwrap();
        server
            .submit(Batch::new("echo").with(Change::add_element(element)))
            .unwrap();

        let request = Request::get("/echo/a/b").body(Bytes::new()).unwrap();
        let dispatched = server.dispatch(request).unwrap();
        let body = String::from_utf8(dispatched.response.body().to_vec()).unwrap();
        assert!(body.contains("servlet_path: /echo\n"), "{body}");
        assert!(body.contains("path_info: /a/b\n"), "{body}");
        assert!(body.contains("context: default\n"), "{body}");
    }
}
