use std::borrow::Cow;
use std::task::{Context, Poll};

use axum::http::{Request, Uri};
use axum::response::Response;
use once_cell::sync::Lazy;
use regex::Regex;
use tower::Service;

/// Layer that normalizes the request path.
///
/// Duplicate slashes are folded into one and a trailing slash is removed, so `//value//gauge/x/`
/// routes like `/value/gauge/x`. The root path is left alone.
#[derive(Clone, Debug)]
pub struct NormalizePath<S> {
    inner: S,
}

impl<S> NormalizePath<S> {
    /// Wraps a service, usually the router.
    pub fn new(inner: S) -> Self {
        Self { inner }
    }
}

impl<S, I, O> Service<Request<I>> for NormalizePath<S>
where
    S: Service<Request<I>, Response = Response<O>>,
{
    type Response = S::Response;
    type Error = S::Error;
    type Future = S::Future;

    #[inline]
    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, mut req: Request<I>) -> Self::Future {
        normalize(req.uri_mut());
        self.inner.call(req)
    }
}

fn normalize_path(path: &str) -> Cow<'_, str> {
    static REPLACE: Lazy<Regex> = Lazy::new(|| Regex::new("/{2,}").unwrap());

    let folded = REPLACE.replace_all(path, "/");
    if folded.len() > 1 && folded.ends_with('/') {
        let trimmed = folded.trim_end_matches('/');
        return Cow::Owned(if trimmed.is_empty() { "/" } else { trimmed }.to_owned());
    }

    folded
}

fn normalize(uri: &mut Uri) {
    let Cow::Owned(new_path) = normalize_path(uri.path()) else {
        return;
    };

    let path_and_query = match uri.query() {
        Some(query) => format!("{new_path}?{query}"),
        None => new_path,
    };

    let mut builder = Uri::builder().path_and_query(path_and_query);
    if let Some(scheme) = uri.scheme() {
        builder = builder.scheme(scheme.clone());
    }
    if let Some(authority) = uri.authority() {
        builder = builder.authority(authority.clone());
    }

    if let Ok(new_uri) = builder.build() {
        *uri = new_uri;
    }
}
