use axum::{
    body::Body,
    http::{HeaderValue, Request},
    middleware::Next,
    response::Response,
};
use tracing::Instrument;

pub const REQUEST_ID_HEADER: &str = "x-request-id";

const MAX_REQUEST_ID_LEN: usize = 128;

#[derive(Clone, Debug)]
pub struct RequestMeta {
    pub request_id: String,
}

fn inbound_request_id(req: &Request<Body>) -> Option<String> {
    let v = req.headers().get(REQUEST_ID_HEADER)?.to_str().ok()?.trim();
    if v.is_empty() || v.len() > MAX_REQUEST_ID_LEN {
        return None;
    }
    Some(v.to_string())
}

// Middleware: propagate or mint `x-request-id`, expose it as `RequestMeta` and
// on the request span, echo it on the response.
pub async fn request_id(mut req: Request<Body>, next: Next) -> Response {
    let request_id =
        inbound_request_id(&req).unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

    let span = tracing::info_span!(
        "request",
        request_id = %request_id,
        method = %req.method(),
        path = %req.uri().path(),
    );
    req.extensions_mut().insert(RequestMeta {
        request_id: request_id.clone(),
    });

    let mut resp = next.run(req).instrument(span).await;
    if let Ok(v) = HeaderValue::from_str(&request_id) {
        resp.headers_mut().insert(REQUEST_ID_HEADER, v);
    }
    resp
}
