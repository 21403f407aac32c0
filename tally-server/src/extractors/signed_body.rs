use axum::extract::rejection::BytesRejection;
use axum::extract::{FromRequest, Request};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use tally_auth::{SIGNATURE_HEADER, VerifyError};
use tally_metrics::DecodeError;

use crate::service::ServiceState;
use crate::utils::ApiErrorResponse;

/// Rejection of a [`SignedBody`].
#[derive(Debug, thiserror::Error)]
pub enum PayloadError {
    /// The body could not be read, for instance because it exceeds the body limit.
    #[error("could not read request body")]
    Body(#[from] BytesRejection),

    /// The signature is missing or does not match the raw body.
    #[error("signature verification failed")]
    Signature(#[from] VerifyError),

    /// The body uses a content encoding other than gzip.
    #[error("unsupported content encoding {0:?}")]
    UnsupportedEncoding(String),

    /// The body could not be decompressed.
    #[error("invalid payload")]
    Decode(#[from] DecodeError),
}

impl PayloadError {
    /// Returns the status code of the error response.
    pub fn status(&self) -> StatusCode {
        match self {
            Self::Body(rejection) => rejection.status(),
            Self::Signature(_) => StatusCode::BAD_REQUEST,
            Self::UnsupportedEncoding(_) => StatusCode::UNSUPPORTED_MEDIA_TYPE,
            Self::Decode(DecodeError::TooLarge(_)) => StatusCode::PAYLOAD_TOO_LARGE,
            Self::Decode(_) => StatusCode::BAD_REQUEST,
        }
    }
}

impl IntoResponse for PayloadError {
    fn into_response(self) -> Response {
        let status = self.status();
        tally_log::debug!("rejected payload: {}", tally_log::LogError(&self));
        (status, ApiErrorResponse::from_error(&self)).into_response()
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum ContentEncoding {
    Identity,
    Gzip,
}

impl ContentEncoding {
    fn from_headers(headers: &HeaderMap) -> Result<Self, PayloadError> {
        let Some(value) = headers.get(header::CONTENT_ENCODING) else {
            return Ok(Self::Identity);
        };

        let value = String::from_utf8_lossy(value.as_bytes());
        match value.trim() {
            "" => Ok(Self::Identity),
            v if v.eq_ignore_ascii_case("identity") => Ok(Self::Identity),
            v if v.eq_ignore_ascii_case("gzip") => Ok(Self::Gzip),
            other => Err(PayloadError::UnsupportedEncoding(other.to_owned())),
        }
    }
}

/// The verified and decompressed body of an ingestion request.
///
/// If a shared key is configured, the `HashSHA256` header must carry the signature of the raw
/// request body as it arrived on the wire. Only after verification is a gzip body decompressed.
#[derive(Debug)]
pub struct SignedBody(pub Vec<u8>);

impl SignedBody {
    /// Returns the decoded body.
    pub fn into_inner(self) -> Vec<u8> {
        self.0
    }
}

impl FromRequest<ServiceState> for SignedBody {
    type Rejection = PayloadError;

    async fn from_request(request: Request, state: &ServiceState) -> Result<Self, Self::Rejection> {
        let encoding = ContentEncoding::from_headers(request.headers())?;
        let signature = request
            .headers()
            .get(SIGNATURE_HEADER)
            .and_then(|value| value.to_str().ok())
            .map(str::to_owned);

        let raw = Bytes::from_request(request, state).await?;
        tally_metrics::verify(&raw, signature.as_deref(), state.shared_key())?;

        let body = match encoding {
            ContentEncoding::Identity => raw.to_vec(),
            ContentEncoding::Gzip => {
                tally_metrics::decompress(&raw, tally_metrics::DEFAULT_DECOMPRESSED_LIMIT)?
            }
        };

        Ok(Self(body))
    }
}
