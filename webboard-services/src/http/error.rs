use std::{convert::Infallible, fmt::Display};

use bytes::Bytes;
use http::{header, HeaderValue, Response, StatusCode};
use service_async::{
    layer::{layer_fn, FactoryLayer},
    AsyncMakeService, MakeService, Service,
};
use tracing::error;

/// Turns errors that escaped dispatch into a bare `500 Internal Server Error`.
#[derive(Debug, Clone)]
pub struct ErrorResponse<S> {
    inner: S,
}

impl<R, S> Service<R> for ErrorResponse<S>
where
    S: Service<R, Response = Response<Bytes>>,
    S::Error: Display,
{
    type Response = Response<Bytes>;
    type Error = Infallible;

    async fn call(&self, req: R) -> Result<Self::Response, Self::Error> {
        match self.inner.call(req).await {
            Ok(resp) => Ok(resp),
            Err(e) => {
                error!("request failed: {e}");
                Ok(internal_error())
            }
        }
    }
}

fn internal_error() -> Response<Bytes> {
    let status = StatusCode::INTERNAL_SERVER_ERROR;
    let reason = status.canonical_reason().unwrap_or("Internal Server Error");
    let mut resp = Response::new(Bytes::from(reason));
    *resp.status_mut() = status;
    resp.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    resp
}

impl<F> ErrorResponse<F> {
    pub fn layer<C>() -> impl FactoryLayer<C, F, Factory = Self> {
        layer_fn(|_c: &C, inner| ErrorResponse { inner })
    }
}

impl<F: MakeService> MakeService for ErrorResponse<F> {
    type Service = ErrorResponse<F::Service>;
    type Error = F::Error;

    fn make_via_ref(&self, old: Option<&Self::Service>) -> Result<Self::Service, Self::Error> {
        Ok(ErrorResponse {
            inner: self.inner.make_via_ref(old.map(|o| &o.inner))?,
        })
    }
}

impl<F: AsyncMakeService> AsyncMakeService for ErrorResponse<F> {
    type Service = ErrorResponse<F::Service>;
    type Error = F::Error;

    async fn make_via_ref(
        &self,
        old: Option<&Self::Service>,
    ) -> Result<Self::Service, Self::Error> {
        Ok(ErrorResponse {
            inner: self.inner.make_via_ref(old.map(|o| &o.inner)).await?,
        })
    }
}
