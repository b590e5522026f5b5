// SPDX-License-Identifier: MIT OR Apache-2.0
//! Small request-scoped middleware not covered by `tower-http`'s
//! off-the-shelf layers.

use axum::extract::Request;
use axum::http::HeaderValue;
use axum::middleware::Next;
use axum::response::Response;

/// Stamps every response with a freshly generated `x-request-id` header,
/// independent of whatever tracing span id the `TraceLayer` assigns.
pub async fn request_id_middleware(req: Request, next: Next) -> Response {
    let id = format!("{:032x}", uuid_like());
    let mut resp = next.run(req).await;
    if let Ok(value) = HeaderValue::from_str(&id) {
        resp.headers_mut().insert("x-request-id", value);
    }
    resp
}

/// A process-local, monotonically increasing id. Not a UUID — this crate
/// has no use for one elsewhere, so it does not carry the `uuid`
/// dependency just for a correlation header.
fn uuid_like() -> u128 {
    use std::sync::atomic::{AtomicU64, Ordering};
    static COUNTER: AtomicU64 = AtomicU64::new(0);
    let pid = std::process::id() as u128;
    let seq = COUNTER.fetch_add(1, Ordering::Relaxed) as u128;
    (pid << 64) | seq
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uuid_like_values_are_distinct() {
        assert_ne!(uuid_like(), uuid_like());
    }
}
