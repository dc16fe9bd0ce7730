//! Request/response capabilities and the collaborator traits elements implement.
use std::collections::BTreeMap;

use bytes::{Bytes, BytesMut};
use http::{header, HeaderMap, HeaderValue, Method, Request, Response, StatusCode};

use crate::{context::ScopedView, ServletError};

/// An inbound request, decorated with the paths the dispatcher resolved for it.
#[derive(Debug)]
pub struct WebRequest {
    inner: Request<Bytes>,
    context_path: String,
    servlet_path: String,
    path_info: Option<String>,
    view: Option<ScopedView>,
    attributes: BTreeMap<String, String>,
}

impl WebRequest {
    pub fn new(inner: Request<Bytes>) -> Self {
        Self {
            inner,
            context_path: String::new(),
            servlet_path: String::new(),
            path_info: None,
            view: None,
            attributes: BTreeMap::new(),
        }
    }

    pub fn method(&self) -> &Method {
        self.inner.method()
    }

    pub fn path(&self) -> &str {
        self.inner.uri().path()
    }

    pub fn query(&self) -> Option<&str> {
        self.inner.uri().query()
    }

    pub fn headers(&self) -> &HeaderMap {
        self.inner.headers()
    }

    pub fn headers_mut(&mut self) -> &mut HeaderMap {
        self.inner.headers_mut()
    }

    pub fn body(&self) -> &Bytes {
        self.inner.body()
    }

    pub fn context_path(&self) -> &str {
        &self.context_path
    }

    pub fn servlet_path(&self) -> &str {
        &self.servlet_path
    }

    pub fn path_info(&self) -> Option<&str> {
        self.path_info.as_deref()
    }

    /// Path below the context, `servlet_path` followed by `path_info`.
    pub fn path_in_context(&self) -> String {
        match &self.path_info {
            Some(info) => format!("{}{}", self.servlet_path, info),
            None => self.servlet_path.clone(),
        }
    }

    /// The context view of the element currently handling the request.
    pub fn view(&self) -> Option<&ScopedView> {
        self.view.as_ref()
    }

    pub fn attribute(&self, key: &str) -> Option<&str> {
        self.attributes.get(key).map(String::as_str)
    }

    pub fn set_attribute(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.attributes.insert(key.into(), value.into());
    }

    pub(crate) fn set_paths(
        &mut self,
        context_path: &str,
        servlet_path: String,
        path_info: Option<String>,
    ) {
        self.context_path = context_path.to_string();
        self.servlet_path = servlet_path;
        self.path_info = path_info;
    }

    pub(crate) fn set_view(&mut self, view: Option<ScopedView>) {
        self.view = view;
    }
}

/// A buffered response.
#[derive(Debug)]
pub struct WebResponse {
    status: StatusCode,
    headers: HeaderMap,
    body: BytesMut,
}

impl Default for WebResponse {
    fn default() -> Self {
        Self::new()
    }
}

impl WebResponse {
    pub fn new() -> Self {
        Self {
            status: StatusCode::OK,
            headers: HeaderMap::new(),
            body: BytesMut::new(),
        }
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn set_status(&mut self, status: StatusCode) {
        self.status = status;
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.headers
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    pub fn write(&mut self, data: &[u8]) {
        self.body.extend_from_slice(data);
    }

    /// Sets an error status and drops whatever body was written so far.
    pub fn send_error(&mut self, status: StatusCode) {
        self.status = status;
        self.body.clear();
    }

    pub fn send_redirect(&mut self, location: &str) {
        self.body.clear();
        self.status = StatusCode::FOUND;
        if let Ok(value) = HeaderValue::from_str(location) {
            self.headers.insert(header::LOCATION, value);
        }
    }

    pub fn reset_body(&mut self) {
        self.body.clear();
    }

    pub fn into_http(self) -> Response<Bytes> {
        let mut response = Response::new(self.body.freeze());
        *response.status_mut() = self.status;
        *response.headers_mut() = self.headers;
        response
    }
}

pub trait Servlet: Send + Sync {
    fn service(&self, req: &mut WebRequest, resp: &mut WebResponse) -> Result<(), ServletError>;
}

impl<F> Servlet for F
where
    F: Fn(&mut WebRequest, &mut WebResponse) -> Result<(), ServletError> + Send + Sync,
{
    fn service(&self, req: &mut WebRequest, resp: &mut WebResponse) -> Result<(), ServletError> {
        self(req, resp)
    }
}

pub trait Filter: Send + Sync {
    /// Handles the request, calling [`FilterChain::proceed`] to pass it on. Not proceeding
    /// short-circuits the rest of the chain.
    fn do_filter(
        &self,
        req: &mut WebRequest,
        resp: &mut WebResponse,
        chain: FilterChain<'_>,
    ) -> Result<(), ServletError>;
}

pub type Terminal<'a> = dyn Fn(&mut WebRequest, &mut WebResponse) -> Result<(), ServletError> + 'a;

/// The remaining filters of a chain plus the handler invoked after the last one.
pub struct FilterChain<'a> {
    filters: &'a [std::sync::Arc<dyn Filter>],
    terminal: &'a Terminal<'a>,
}

impl<'a> FilterChain<'a> {
    pub fn new(filters: &'a [std::sync::Arc<dyn Filter>], terminal: &'a Terminal<'a>) -> Self {
        Self { filters, terminal }
    }

    pub fn remaining(&self) -> usize {
        self.filters.len()
    }

    pub fn proceed(self, req: &mut WebRequest, resp: &mut WebResponse) -> Result<(), ServletError> {
        match self.filters.split_first() {
            Some((filter, rest)) => filter.do_filter(
                req,
                resp,
                FilterChain {
                    filters: rest,
                    terminal: self.terminal,
                },
            ),
            None => (self.terminal)(req, resp),
        }
    }
}

/// Notified when the element is activated in or withdrawn from a context.
pub trait ContextListener: Send + Sync {
    fn context_initialized(&self, view: &ScopedView);

    fn context_destroyed(&self, _view: &ScopedView) {}
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    struct Tag(&'static str);

    impl Filter for Tag {
        fn do_filter(
            &self,
            req: &mut WebRequest,
            resp: &mut WebResponse,
            chain: FilterChain<'_>,
        ) -> Result<(), ServletError> {
            resp.write(self.0.as_bytes());
            chain.proceed(req, resp)
        }
    }

    struct Stop;

    impl Filter for Stop {
        fn do_filter(
            &self,
            _req: &mut WebRequest,
            resp: &mut WebResponse,
            _chain: FilterChain<'_>,
        ) -> Result<(), ServletError> {
            resp.send_error(StatusCode::UNAUTHORIZED);
            Ok(())
        }
    }

    fn terminal(_req: &mut WebRequest, resp: &mut WebResponse) -> Result<(), ServletError> {
        resp.write(b"end");
        Ok(())
    }

    #[test]
    fn test_chain_runs_in_order() {
        let filters: Vec<Arc<dyn Filter>> = vec![Arc::new(Tag("a,")), Arc::new(Tag("b,"))];
        let mut req = WebRequest::new(Request::new(Bytes::new()));
        let mut resp = WebResponse::new();
        FilterChain::new(&filters, &terminal)
            .proceed(&mut req, &mut resp)
            .unwrap();
        assert_eq!(b"a,b,end", resp.body());
    }

    #[test]
    fn test_chain_short_circuit() {
        let filters: Vec<Arc<dyn Filter>> = vec![Arc::new(Stop), Arc::new(Tag("b,"))];
        let mut req = WebRequest::new(Request::new(Bytes::new()));
        let mut resp = WebResponse::new();
        FilterChain::new(&filters, &terminal)
            .proceed(&mut req, &mut resp)
            .unwrap();
        assert_eq!(StatusCode::UNAUTHORIZED, resp.status());
        assert!(resp.body().is_empty());
    }

    #[test]
    fn test_closure_servlet_and_redirect() {
        let servlet = |_req: &mut WebRequest, resp: &mut WebResponse| -> Result<(), ServletError> {
            resp.send_redirect("/c/index.html");
            Ok(())
        };
        let mut req = WebRequest::new(Request::new(Bytes::new()));
        let mut resp = WebResponse::new();
        servlet.service(&mut req, &mut resp).unwrap();
        let response = resp.into_http();
        assert_eq!(StatusCode::FOUND, response.status());
        assert_eq!("/c/index.html", response.headers()[header::LOCATION]);
    }
}
