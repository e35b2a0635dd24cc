use async_trait::async_trait;
use std::error::Error as StdError;
use std::io;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::{Method, RequestSpec, Transport, TransportError, TransportErrorCode, TransportResponse};

/// `reqwest`-backed transport used outside of tests.
#[derive(Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new(connect_timeout: Duration) -> Result<Self, TransportError> {
        let client = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .user_agent(concat!("palaver/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|err| TransportError::new(TransportErrorCode::Other, err.to_string()))?;
        Ok(Self { client })
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }

    fn build(&self, spec: &RequestSpec) -> reqwest::RequestBuilder {
        let method = match spec.method {
            Method::Get => reqwest::Method::GET,
            Method::Post => reqwest::Method::POST,
            Method::Put => reqwest::Method::PUT,
            Method::Patch => reqwest::Method::PATCH,
            Method::Delete => reqwest::Method::DELETE,
        };

        let mut request = self.client.request(method, &spec.url);
        for (name, value) in &spec.headers {
            request = request.header(name.as_str(), value.as_str());
        }
        if let Some(body) = &spec.body {
            request = request.body(body.clone());
        }
        request
    }

    async fn perform(&self, spec: &RequestSpec) -> Result<TransportResponse, TransportError> {
        let response = self.build(spec).send().await.map_err(map_reqwest_error)?;

        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|value| (name.as_str().to_string(), value.to_string()))
            })
            .collect();
        let body = response.text().await.map_err(map_reqwest_error)?;

        Ok(TransportResponse {
            status,
            headers,
            body,
        })
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(
        &self,
        spec: &RequestSpec,
        cancel: &CancellationToken,
    ) -> Result<TransportResponse, TransportError> {
        debug!(method = %spec.method, url = %spec.url, "sending request");
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(TransportError::new(
                TransportErrorCode::Other,
                "request abandoned after cancellation",
            )),
            result = self.perform(spec) => result,
        }
    }
}

fn map_reqwest_error(err: reqwest::Error) -> TransportError {
    let code = if err.is_timeout() {
        TransportErrorCode::Timeout
    } else {
        classify_error_chain(&err)
    };
    TransportError::new(code, err.to_string())
}

/// Walks the source chain looking for the I/O error or resolver message that
/// explains the failure.
fn classify_error_chain(err: &(dyn StdError + 'static)) -> TransportErrorCode {
    let mut current: Option<&(dyn StdError + 'static)> = Some(err);
    while let Some(error) = current {
        if let Some(io_err) = error.downcast_ref::<io::Error>() {
            match io_err.kind() {
                io::ErrorKind::ConnectionRefused => return TransportErrorCode::ConnectionRefused,
                io::ErrorKind::ConnectionReset | io::ErrorKind::ConnectionAborted => {
                    return TransportErrorCode::Reset
                }
                io::ErrorKind::TimedOut => return TransportErrorCode::Timeout,
                _ => {}
            }
        }
        if let Some(code) = code_from_message(&error.to_string()) {
            return code;
        }
        current = error.source();
    }
    TransportErrorCode::Other
}

fn code_from_message(message: &str) -> Option<TransportErrorCode> {
    let lower = message.to_ascii_lowercase();
    if lower.contains("proxy") {
        Some(TransportErrorCode::Proxy)
    } else if lower.contains("dns")
        || lower.contains("failed to lookup")
        || lower.contains("name or service not known")
        || lower.contains("nodename nor servname")
    {
        Some(TransportErrorCode::NameNotResolved)
    } else if lower.contains("connection refused") {
        Some(TransportErrorCode::ConnectionRefused)
    } else if lower.contains("connection reset") || lower.contains("broken pipe") {
        Some(TransportErrorCode::Reset)
    } else if lower.contains("timed out") {
        Some(TransportErrorCode::Timeout)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fmt;

    #[derive(Debug)]
    struct Wrapper(io::Error);

    impl fmt::Display for Wrapper {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str("error sending request")
        }
    }

    impl StdError for Wrapper {
        fn source(&self) -> Option<&(dyn StdError + 'static)> {
            Some(&self.0)
        }
    }

    #[test]
    fn io_error_kinds_map_to_codes() {
        let refused = Wrapper(io::Error::from(io::ErrorKind::ConnectionRefused));
        let reset = Wrapper(io::Error::from(io::ErrorKind::ConnectionReset));

        assert_eq!(
            classify_error_chain(&refused),
            TransportErrorCode::ConnectionRefused
        );
        assert_eq!(classify_error_chain(&reset), TransportErrorCode::Reset);
    }

    #[test]
    fn resolver_messages_map_to_name_not_resolved() {
        let dns = Wrapper(io::Error::other(
            "failed to lookup address information: Name or service not known",
        ));
        assert_eq!(
            classify_error_chain(&dns),
            TransportErrorCode::NameNotResolved
        );
    }

    #[test]
    fn proxy_and_unknown_messages() {
        assert_eq!(
            code_from_message("Proxy CONNECT aborted"),
            Some(TransportErrorCode::Proxy)
        );
        assert_eq!(code_from_message("something odd"), None);
    }

    #[tokio::test]
    async fn cancelled_token_abandons_request() {
        let transport = HttpTransport::with_client(reqwest::Client::new());
        let token = CancellationToken::new();
        token.cancel();

        // Port 9 (discard) on a reserved TEST-NET address; never reached.
        let result = transport
            .send(&RequestSpec::get("http://192.0.2.1:9/api/health"), &token)
            .await;

        assert_eq!(
            result.map_err(|err| err.code),
            Err(TransportErrorCode::Other)
        );
    }
}
