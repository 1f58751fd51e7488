use crate::config::BridgeConfig;
use crate::error::{PlexError, Result};
use crate::protocol::{ErrorBody, PinResponse};
use crate::transport::{plex_headers, HttpResponse, Transport};
use crate::types::{ClientIdentifier, Credential, Pin};
use reqwest::header::{HeaderValue, ACCEPT, CONTENT_TYPE};
use reqwest::Method;
use std::sync::Arc;
use tokio::time::{interval, timeout, MissedTickBehavior};
use url::form_urlencoded;

const APP_AUTH_URL: &str = "https://app.plex.tv/auth";

/// PIN-based pairing against the Plex account API
///
/// The user approves the PIN code in a browser at [`auth_url`]; meanwhile
/// [`wait_for_token`] polls until the account hands out a token.
///
/// [`auth_url`]: PinAuth::auth_url
/// [`wait_for_token`]: PinAuth::wait_for_token
pub struct PinAuth {
    transport: Transport,
    config: Arc<BridgeConfig>,
    client_identifier: ClientIdentifier,
}

impl PinAuth {
    pub fn new(config: Arc<BridgeConfig>, client_identifier: ClientIdentifier) -> Result<Self> {
        Ok(Self {
            transport: Transport::new(config.request_timeout())?,
            config,
            client_identifier,
        })
    }

    pub fn client_identifier(&self) -> &ClientIdentifier {
        &self.client_identifier
    }

    /// Request a new strong PIN
    pub async fn create_pin(&self) -> Result<Pin> {
        let url = format!("{}/api/v2/pins", self.config.account_base());
        let mut headers = self.headers()?;
        headers.insert(
            CONTENT_TYPE,
            HeaderValue::from_static("application/x-www-form-urlencoded"),
        );
        let body = form_urlencoded::Serializer::new(String::new())
            .append_pair("strong", "true")
            .finish();

        let response = self
            .transport
            .request(Method::POST, &url, headers, Some(body), self.config.request_timeout())
            .await?;
        let pin: PinResponse = parse_json(&response)?;

        tracing::info!("Created PIN {}", pin.id);
        Ok(Pin {
            id: pin.id,
            code: pin.code,
        })
    }

    /// Check whether the PIN was approved; returns the token once it is
    pub async fn check_pin(&self, pin_id: u64) -> Result<Option<String>> {
        let url = format!("{}/api/v2/pins/{}", self.config.account_base(), pin_id);
        let response = self.transport.get(&url, self.headers()?).await?;
        let pin: PinResponse = parse_json(&response)?;

        Ok(pin.auth_token.filter(|token| !token.is_empty()))
    }

    /// Browser URL where the user approves `pin`
    pub fn auth_url(&self, pin: &Pin) -> String {
        let query = form_urlencoded::Serializer::new(String::new())
            .append_pair("clientID", self.client_identifier.as_str())
            .append_pair("code", &pin.code)
            .append_pair("context[device][product]", &self.config.product)
            .finish();
        format!("{}#?{}", APP_AUTH_URL, query)
    }

    /// Poll until the PIN is approved, then stop polling
    ///
    /// Failed checks are logged and retried on the next interval. Gives up
    /// with `PinTimeout` after the configured PIN timeout.
    pub async fn wait_for_token(&self, pin: &Pin) -> Result<Credential> {
        let poll = async {
            let mut ticker = interval(self.config.pin_poll_interval());
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                ticker.tick().await;
                match self.check_pin(pin.id).await {
                    Ok(Some(token)) => {
                        tracing::info!("PIN {} approved", pin.id);
                        return Credential::new(token, self.client_identifier.clone());
                    }
                    Ok(None) => tracing::debug!("PIN {} not approved yet", pin.id),
                    Err(e) => tracing::warn!("Check PIN error: {}", e),
                }
            }
        };

        timeout(self.config.pin_timeout(), poll)
            .await
            .map_err(|_| PlexError::PinTimeout)
    }

    fn headers(&self) -> Result<reqwest::header::HeaderMap> {
        let mut headers = plex_headers(None, self.client_identifier.as_str(), &self.config.product)?;
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));
        Ok(headers)
    }
}

fn parse_json(response: &HttpResponse) -> Result<PinResponse> {
    if !response.status.is_success() {
        let detail = response
            .json::<ErrorBody>()
            .ok()
            .and_then(|body| body.error)
            .unwrap_or_else(|| response.status_text());
        return Err(PlexError::Api {
            status: response.status.as_u16(),
            detail,
        });
    }
    response.json()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;
    use wiremock::matchers::{body_string_contains, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn pin_auth(account: &MockServer, pin_timeout_ms: u64) -> PinAuth {
        let config = BridgeConfig {
            account_base_url: account.uri(),
            pin_poll_interval_ms: 20,
            pin_timeout_ms,
            ..BridgeConfig::default()
        };
        PinAuth::new(Arc::new(config), ClientIdentifier("client-1".into())).unwrap()
    }

    #[tokio::test]
    async fn creates_strong_pin() {
        let account = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/v2/pins"))
            .and(header("X-Plex-Client-Identifier", "client-1"))
            .and(body_string_contains("strong=true"))
            .respond_with(ResponseTemplate::new(201).set_body_json(json!({"id": 77, "code": "ABCD"})))
            .expect(1)
            .mount(&account)
            .await;

        let pin = pin_auth(&account, 1000).create_pin().await.unwrap();
        assert_eq!(pin, Pin { id: 77, code: "ABCD".into() });
    }

    #[tokio::test]
    async fn approved_pin_yields_credential_and_polling_stops() {
        let account = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v2/pins/77"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": 77, "code": "ABCD", "authToken": "abc"})))
            .expect(1)
            .mount(&account)
            .await;

        let auth = pin_auth(&account, 1000);
        let pin = Pin { id: 77, code: "ABCD".into() };
        let credential = auth.wait_for_token(&pin).await.unwrap();

        assert_eq!(credential.account_token, "abc");
        assert_eq!(credential.client_identifier.as_str(), "client-1");

        // give a would-be poller time to fire again
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    #[tokio::test]
    async fn unapproved_pin_times_out() {
        let account = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v2/pins/5"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": 5, "code": "X", "authToken": null})))
            .mount(&account)
            .await;

        let auth = pin_auth(&account, 150);
        let err = auth
            .wait_for_token(&Pin { id: 5, code: "X".into() })
            .await
            .unwrap_err();
        assert!(matches!(err, PlexError::PinTimeout));
    }

    #[tokio::test]
    async fn error_body_is_surfaced() {
        let account = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v2/pins/9"))
            .respond_with(ResponseTemplate::new(404).set_body_json(json!({"error": "Pin not found"})))
            .mount(&account)
            .await;

        let err = pin_auth(&account, 1000).check_pin(9).await.unwrap_err();
        assert!(matches!(err, PlexError::Api { status: 404, ref detail } if detail == "Pin not found"));
    }

    #[test]
    fn auth_url_carries_client_and_code() {
        let config = BridgeConfig::default();
        let auth = PinAuth::new(Arc::new(config), ClientIdentifier("client-1".into())).unwrap();
        let url = auth.auth_url(&Pin { id: 1, code: "ABCD".into() });

        assert!(url.starts_with("https://app.plex.tv/auth#?clientID=client-1&code=ABCD"));
        assert!(url.contains("context%5Bdevice%5D%5Bproduct%5D=Plex+Bridge"));
    }
}
