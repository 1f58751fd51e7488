use crate::error::{PlexError, Result};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_TYPE};
use reqwest::{Client, Method, StatusCode};
use serde::de::DeserializeOwned;
use std::time::{Duration, Instant};
use tokio::time::timeout;

/// A fully-read HTTP response
#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: StatusCode,
    pub content_type: Option<String>,
    pub body: Vec<u8>,
}

impl HttpResponse {
    pub fn is_json(&self) -> bool {
        self.content_type
            .as_deref()
            .is_some_and(|ct| ct.to_ascii_lowercase().contains("json"))
    }

    pub fn json<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_slice(&self.body)?)
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    /// Status reason phrase, falling back to the numeric code
    pub fn status_text(&self) -> String {
        self.status
            .canonical_reason()
            .map(str::to_string)
            .unwrap_or_else(|| self.status.as_str().to_string())
    }
}

/// Bounded-timeout HTTP request primitive
///
/// Every call races the whole exchange (send and body read) against a timer.
/// When the timer wins, the in-flight request is dropped and
/// [`PlexError::Timeout`] is returned. No retries happen here.
#[derive(Debug, Clone)]
pub struct Transport {
    client: Client,
    default_timeout: Duration,
}

impl Transport {
    pub fn new(default_timeout: Duration) -> Result<Self> {
        let client = Client::builder().build()?;
        Ok(Self {
            client,
            default_timeout,
        })
    }

    pub fn default_timeout(&self) -> Duration {
        self.default_timeout
    }

    /// Issue a request bounded by `limit`
    pub async fn request(
        &self,
        method: Method,
        url: &str,
        headers: HeaderMap,
        body: Option<String>,
        limit: Duration,
    ) -> Result<HttpResponse> {
        tracing::debug!("{} {}", method, redact(url));

        let mut builder = self.client.request(method, url).headers(headers);
        if let Some(body) = body {
            builder = builder.body(body);
        }

        let started = Instant::now();
        let exchange = async {
            let response = builder.send().await?;
            let status = response.status();
            let content_type = response
                .headers()
                .get(CONTENT_TYPE)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string);
            let body = response.bytes().await?;

            Ok::<_, PlexError>(HttpResponse {
                status,
                content_type,
                body: body.to_vec(),
            })
        };

        match timeout(limit, exchange).await {
            Ok(result) => result,
            Err(_) => {
                let elapsed = started.elapsed();
                tracing::warn!("Request to {} timed out after {:?}", redact(url), elapsed);
                Err(PlexError::Timeout { elapsed })
            }
        }
    }

    /// GET bounded by the default timeout
    pub async fn get(&self, url: &str, headers: HeaderMap) -> Result<HttpResponse> {
        self.request(Method::GET, url, headers, None, self.default_timeout)
            .await
    }
}

/// Standard `X-Plex-*` identification headers
pub(crate) fn plex_headers(
    token: Option<&str>,
    client_identifier: &str,
    product: &str,
) -> Result<HeaderMap> {
    let mut headers = HeaderMap::new();
    insert_header(&mut headers, "x-plex-client-identifier", client_identifier)?;
    insert_header(&mut headers, "x-plex-product", product)?;
    if let Some(token) = token {
        insert_header(&mut headers, "x-plex-token", token)?;
    }
    Ok(headers)
}

fn insert_header(headers: &mut HeaderMap, name: &'static str, value: &str) -> Result<()> {
    let value = HeaderValue::from_str(value)
        .map_err(|_| PlexError::Config(format!("Invalid value for header {}", name)))?;
    headers.insert(HeaderName::from_static(name), value);
    Ok(())
}

/// Strip query strings (which may carry tokens) before logging a URL
fn redact(url: &str) -> &str {
    url.split('?').next().unwrap_or(url)
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn returns_body_and_content_type() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/system"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"ok": true})))
            .mount(&server)
            .await;

        let transport = Transport::new(Duration::from_secs(2)).unwrap();
        let response = transport
            .get(&format!("{}/system", server.uri()), HeaderMap::new())
            .await
            .unwrap();

        assert_eq!(response.status, StatusCode::OK);
        assert!(response.is_json());
        let body: serde_json::Value = response.json().unwrap();
        assert_eq!(body["ok"], true);
    }

    #[tokio::test]
    async fn slow_response_times_out() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(3)))
            .mount(&server)
            .await;

        let transport = Transport::new(Duration::from_secs(10)).unwrap();
        let err = transport
            .request(
                Method::GET,
                &server.uri(),
                HeaderMap::new(),
                None,
                Duration::from_millis(100),
            )
            .await
            .unwrap_err();

        match err {
            PlexError::Timeout { elapsed } => assert!(elapsed >= Duration::from_millis(100)),
            other => panic!("expected timeout, got {other:?}"),
        }
    }

    #[test]
    fn redact_drops_query() {
        assert_eq!(redact("http://h/a?token=x"), "http://h/a");
        assert_eq!(redact("http://h/a"), "http://h/a");
    }
}
