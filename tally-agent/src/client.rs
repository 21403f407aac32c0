use reqwest::StatusCode;
use reqwest::header::{ACCEPT_ENCODING, CONTENT_ENCODING, CONTENT_TYPE};
use tally_auth::SIGNATURE_HEADER;
use tally_config::Config;
use tally_metrics::EncodedBatch;

/// Raised when the HTTP client cannot be constructed.
#[derive(Debug, thiserror::Error)]
#[error("failed to build http client")]
pub struct HttpError(#[from] reqwest::Error);

/// The outcome of a single failed delivery attempt.
#[derive(Debug, thiserror::Error)]
pub enum SendError {
    /// The request did not produce a response.
    #[error("could not send request to server")]
    SendFailed(#[source] reqwest::Error),

    /// The server answered with a non-success status code.
    #[error("server returned error {0}")]
    ResponseError(StatusCode),
}

impl SendError {
    /// Returns `true` if the error indicates a network downtime.
    ///
    /// Connection failures, timeouts and broken connections qualify. Failures to build the request
    /// do not.
    pub fn is_network_error(&self) -> bool {
        match self {
            Self::SendFailed(error) => {
                !error.is_builder()
                    && (error.is_connect() || error.is_timeout() || error.is_request())
            }
            Self::ResponseError(_) => false,
        }
    }

    /// Returns `true` if the same request may succeed when sent again.
    ///
    /// Network errors and server errors (5xx) are retryable. Client errors (4xx) are final.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::SendFailed(_) => self.is_network_error(),
            Self::ResponseError(status) => status.is_server_error(),
        }
    }
}

/// Sends encoded batches to the batch endpoint of the server.
#[derive(Clone, Debug)]
pub struct UpstreamClient {
    client: reqwest::Client,
    url: String,
}

impl UpstreamClient {
    /// Creates a client for the configured upstream address.
    pub fn new(config: &Config) -> Result<Self, HttpError> {
        let client = reqwest::ClientBuilder::new()
            .connect_timeout(config.http_connection_timeout())
            .timeout(config.http_timeout())
            .gzip(true)
            .build()?;

        Ok(Self {
            client,
            url: format!("http://{}/updates", config.upstream_address()),
        })
    }

    /// Returns the URL batches are sent to.
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Performs a single delivery attempt.
    pub async fn send(&self, batch: &EncodedBatch) -> Result<(), SendError> {
        let mut builder = self
            .client
            .post(&self.url)
            .header(CONTENT_TYPE, "application/json")
            .header(CONTENT_ENCODING, "gzip")
            .header(ACCEPT_ENCODING, "gzip")
            .body(batch.payload.clone());

        if let Some(ref signature) = batch.signature {
            builder = builder.header(SIGNATURE_HEADER, signature.as_str());
        }

        let response = builder.send().await.map_err(SendError::SendFailed)?;
        let status = response.status();

        // Drain the body so the connection can be reused.
        let _ = response.bytes().await;

        if status.is_success() {
            Ok(())
        } else {
            Err(SendError::ResponseError(status))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_classification() {
        assert!(SendError::ResponseError(StatusCode::INTERNAL_SERVER_ERROR).is_retryable());
        assert!(SendError::ResponseError(StatusCode::BAD_GATEWAY).is_retryable());
        assert!(!SendError::ResponseError(StatusCode::BAD_REQUEST).is_retryable());
        assert!(!SendError::ResponseError(StatusCode::NOT_FOUND).is_retryable());
    }

    #[tokio::test]
    async fn test_connect_error_is_retryable() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let error = reqwest::get(format!("http://{addr}/")).await.unwrap_err();
        assert!(SendError::SendFailed(error).is_retryable());
    }

    #[tokio::test]
    async fn test_builder_error_is_terminal() {
        let error = reqwest::Client::new()
            .post("not a url")
            .send()
            .await
            .unwrap_err();
        assert!(!SendError::SendFailed(error).is_retryable());
    }

    #[test]
    fn test_url() {
        let config = Config::from_json_value(serde_json::json!({
            "agent": {"address": "127.0.0.1:9000"}
        }))
        .unwrap();

        let client = UpstreamClient::new(&config).unwrap();
        assert_eq!(client.url(), "http://127.0.0.1:9000/updates");
    }
}
