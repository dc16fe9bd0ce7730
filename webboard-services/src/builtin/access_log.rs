use std::time::Instant;

use tracing::info;
use webboard_core::{
    http::{Filter, FilterChain, WebRequest, WebResponse},
    ServletError,
};

/// Logs one line per request passing through it, after the rest of the chain ran.
#[derive(Debug, Default, Clone, Copy)]
pub struct AccessLogFilter;

impl Filter for AccessLogFilter {
    fn do_filter(
        &self,
        req: &mut WebRequest,
        resp: &mut WebResponse,
        chain: FilterChain<'_>,
    ) -> Result<(), ServletError> {
        let start = Instant::now();
        let result = chain.proceed(req, resp);
        info!(
            method = %req.method(),
            path = req.path(),
            status = resp.status().as_u16(),
            failed = result.is_err(),
            elapsed_us = start.elapsed().as_micros() as u64,
            "access"
        );
        result
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use bytes::Bytes;
    use http::{Request, StatusCode};
    use webboard_core::http::Terminal;

    use super::*;

    #[test]
    fn test_passes_through() {
        let filters: Vec<Arc<dyn Filter>> = vec![Arc::new(AccessLogFilter)];
        let terminal: &Terminal<'_> = &|_req: &mut WebRequest, resp: &mut WebResponse| {
            resp.set_status(StatusCode::ACCEPTED);
            resp.write(b"done");
            Ok(())
        };
        let mut req = WebRequest::new(Request::get("/x").body(Bytes::new()).unwrap());
        let mut resp = WebResponse::new();
        FilterChain::new(&filters, terminal)
            .proceed(&mut req, &mut resp)
            .unwrap();
        assert_eq!(StatusCode::ACCEPTED, resp.status());
        assert_eq!(b"done", resp.body());
    }
}
