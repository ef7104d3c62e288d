use axum::{
    body::Body,
    http::{header, HeaderMap, HeaderName, HeaderValue, Request, Response},
    middleware::Next,
};

// The API only serves JSON, redirects and the reminder event stream, so
// nothing needs to load from other origins.
const CSP: &str = "default-src 'none'; connect-src 'self'; img-src 'self' https:; object-src 'none'; base-uri 'none'; form-action 'self'; frame-ancestors 'none'";

fn insert_missing(headers: &mut HeaderMap, name: HeaderName, value: &'static str) {
    if !headers.contains_key(&name) {
        headers.insert(name, HeaderValue::from_static(value));
    }
}

/// Adds Content-Security-Policy and related hardening headers unless a
/// handler already set them.
pub async fn csp_middleware(req: Request<Body>, next: Next) -> Response<Body> {
    let mut res = next.run(req).await;
    let headers = res.headers_mut();

    insert_missing(headers, header::CONTENT_SECURITY_POLICY, CSP);
    insert_missing(headers, header::REFERRER_POLICY, "no-referrer");
    insert_missing(headers, header::X_CONTENT_TYPE_OPTIONS, "nosniff");

    res
}
