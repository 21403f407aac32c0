use std::convert::Infallible;
use std::net::SocketAddr;

use axum::extract::{ConnectInfo, FromRequestParts};
use axum::http::HeaderMap;
use axum::http::request::Parts;

/// The IP address of the client that sent the request.
///
/// Taken from `X-Real-IP`, then the first entry of `X-Forwarded-For`, then the peer address of
/// the connection. Empty if none is available.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct ClientIp(String);

impl ClientIp {
    /// Returns the address as string.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Consumes the extractor and returns the address.
    pub fn into_inner(self) -> String {
        self.0
    }

    fn from_headers(headers: &HeaderMap) -> Option<String> {
        let header = |name: &str| {
            headers
                .get(name)
                .and_then(|value| value.to_str().ok())
                .map(str::trim)
                .filter(|value| !value.is_empty())
        };

        if let Some(real_ip) = header("x-real-ip") {
            return Some(real_ip.to_owned());
        }

        let forwarded = header("x-forwarded-for")?;
        forwarded
            .split(',')
            .map(str::trim)
            .find(|entry| !entry.is_empty())
            .map(str::to_owned)
    }
}

impl AsRef<str> for ClientIp {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl From<ClientIp> for String {
    fn from(ip: ClientIp) -> Self {
        ip.into_inner()
    }
}

impl<S> FromRequestParts<S> for ClientIp
where
    S: Send + Sync,
{
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _: &S) -> Result<Self, Self::Rejection> {
        if let Some(ip) = Self::from_headers(&parts.headers) {
            return Ok(Self(ip));
        }

        let peer = parts
            .extensions
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| addr.ip().to_string())
            .unwrap_or_default();

        Ok(Self(peer))
    }
}
