//! [`service_async`] adapters that put a [`WebServer`] behind an HTTP service stack.
use std::{convert::Infallible, sync::Arc};

use bytes::Bytes;
use http::{Request, Response};
use service_async::{AsyncMakeService, MakeService, Service};
use tracing::debug;
use webboard_core::{server::WebServer, DispatchError};

mod error;
pub use error::ErrorResponse;

/// Dispatches every request against the routing table current at the time of the call.
#[derive(Debug, Clone)]
pub struct DispatchService {
    server: Arc<WebServer>,
}

impl DispatchService {
    pub fn new(server: Arc<WebServer>) -> Self {
        Self { server }
    }

    pub fn factory(server: Arc<WebServer>) -> DispatchServiceFactory {
        DispatchServiceFactory { server }
    }
}

impl Service<Request<Bytes>> for DispatchService {
    type Response = Response<Bytes>;
    type Error = DispatchError;

    async fn call(&self, req: Request<Bytes>) -> Result<Self::Response, Self::Error> {
        let method = req.method().clone();
        let path = req.uri().path().to_string();
        let dispatched = self.server.dispatch(req)?;
        debug!(
            %method,
            %path,
            outcome = ?dispatched.outcome,
            status = dispatched.response.status().as_u16(),
            "dispatched"
        );
        Ok(dispatched.response)
    }
}

#[derive(Debug, Clone)]
pub struct DispatchServiceFactory {
    server: Arc<WebServer>,
}

// The server is shared, so a rebuilt service keeps dispatching against the same model.
impl MakeService for DispatchServiceFactory {
    type Service = DispatchService;
    type Error = Infallible;

    fn make_via_ref(&self, _old: Option<&Self::Service>) -> Result<Self::Service, Self::Error> {
        Ok(DispatchService {
            server: self.server.clone(),
        })
    }
}

impl AsyncMakeService for DispatchServiceFactory {
    type Service = DispatchService;
    type Error = Infallible;

    async fn make_via_ref(
        &self,
        _old: Option<&Self::Service>,
    ) -> Result<Self::Service, Self::Error> {
        Ok(DispatchService {
            server: self.server.clone(),
        })
    }
}
