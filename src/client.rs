use crate::config::BridgeConfig;
use crate::error::{PlexError, Result};
use crate::locator::ServerLocator;
use crate::protocol::{Envelope, ErrorBody, SessionMetadata};
use crate::transport::{plex_headers, HttpResponse, Transport};
use crate::types::{Credential, Endpoint, LibraryItem, LibrarySection, ServerIdentity, Session};
use reqwest::header::{HeaderValue, ACCEPT};
use reqwest::{Method, StatusCode};
use serde_json::Value;
use std::sync::Arc;
use url::Url;

/// Authenticated request layer over the resolved server endpoint
///
/// Transport-level failures (timeouts, refused connections) invalidate the
/// resolved endpoint so the next call re-resolves. The error itself is
/// returned unchanged; nothing is retried here.
pub struct PlexClient {
    transport: Transport,
    config: Arc<BridgeConfig>,
    credential: Credential,
    locator: ServerLocator,
}

impl PlexClient {
    pub fn new(
        config: Arc<BridgeConfig>,
        credential: Credential,
        server: ServerIdentity,
    ) -> Result<Self> {
        let transport = Transport::new(config.request_timeout())?;
        let locator = ServerLocator::new(
            transport.clone(),
            config.clone(),
            credential.clone(),
            server,
        );

        Ok(Self {
            transport,
            config,
            credential,
            locator,
        })
    }

    pub fn locator(&self) -> &ServerLocator {
        &self.locator
    }

    pub fn credential(&self) -> &Credential {
        &self.credential
    }

    /// Resolve (or reuse) the server endpoint
    pub async fn endpoint(&self) -> Result<Endpoint> {
        self.require_token()?;
        self.locator.resolve().await
    }

    /// Drop the resolved endpoint so the next call re-resolves
    pub fn invalidate_endpoint(&self) {
        self.locator.invalidate();
    }

    fn require_token(&self) -> Result<()> {
        if self.credential.account_token.is_empty() {
            return Err(PlexError::MissingCredential);
        }
        Ok(())
    }

    /// Issue an authenticated call against the server
    ///
    /// Returns `None` for 204 responses and for successful non-JSON bodies.
    pub async fn call(&self, method: Method, path: &str) -> Result<Option<Value>> {
        self.require_token()?;
        let endpoint = self.locator.resolve().await?;

        let url = format!("{}{}", endpoint.base_url(), path);
        let mut headers = plex_headers(
            Some(&self.credential.account_token),
            self.credential.client_identifier.as_str(),
            &self.config.product,
        )?;
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));

        let response = match self
            .transport
            .request(method, &url, headers, None, self.config.request_timeout())
            .await
        {
            Ok(response) => response,
            Err(e) => {
                if e.is_transport() {
                    tracing::warn!("Call to {} failed at transport level: {}", path, e);
                    self.locator.invalidate();
                }
                return Err(e);
            }
        };

        interpret(response)
    }

    async fn get(&self, path: &str) -> Result<Option<Value>> {
        self.call(Method::GET, path).await
    }

    /// All active playback sessions
    pub async fn sessions(&self) -> Result<Vec<Session>> {
        let Some(body) = self.get("/status/sessions").await? else {
            return Ok(Vec::new());
        };
        let envelope: Envelope<SessionMetadata> = serde_json::from_value(body)?;
        Ok(envelope.metadata().into_iter().map(Session::from).collect())
    }

    /// One session by key
    pub async fn session(&self, session_key: &str) -> Result<Session> {
        self.sessions()
            .await?
            .into_iter()
            .find(|session| session.session_key == session_key)
            .ok_or_else(|| PlexError::SessionNotFound(session_key.to_string()))
    }

    pub async fn library_sections(&self) -> Result<Vec<LibrarySection>> {
        let Some(body) = self.get("/library/sections").await? else {
            return Ok(Vec::new());
        };
        let envelope: Envelope<LibrarySection> = serde_json::from_value(body)?;
        Ok(envelope.directory())
    }

    /// Scan a library section for changes
    pub async fn refresh_library(&self, key: &str) -> Result<()> {
        self.get(&format!("/library/sections/{}/refresh", encode_segment(key)))
            .await?;
        Ok(())
    }

    /// Force a full rescan of a library section
    pub async fn rescan_library(&self, key: &str) -> Result<()> {
        self.get(&format!(
            "/library/sections/{}/refresh?force=1",
            encode_segment(key)
        ))
        .await?;
        Ok(())
    }

    pub async fn recently_added(&self) -> Result<Vec<LibraryItem>> {
        let Some(body) = self.get("/library/recentlyAdded").await? else {
            return Ok(Vec::new());
        };
        let envelope: Envelope<LibraryItem> = serde_json::from_value(body)?;
        Ok(envelope.metadata())
    }

    /// Websocket URL for the notification stream on the resolved endpoint
    pub async fn notification_url(&self) -> Result<String> {
        let endpoint = self.endpoint().await?;
        let mut url = Url::parse(&format!(
            "{}://{}:{}/:/websockets/notifications",
            endpoint.websocket_scheme(),
            endpoint.host,
            endpoint.port
        ))?;
        url.query_pairs_mut()
            .append_pair("token", &self.credential.account_token);
        Ok(url.into())
    }
}

fn interpret(response: HttpResponse) -> Result<Option<Value>> {
    let status = response.status;

    if status == StatusCode::NO_CONTENT {
        return Ok(None);
    }

    if !response.is_json() {
        return if status.is_success() {
            Ok(None)
        } else {
            Err(status_error(status, response.status_text()))
        };
    }

    if !status.is_success() {
        let detail = response
            .json::<ErrorBody>()
            .ok()
            .and_then(|body| body.error)
            .unwrap_or_else(|| response.status_text());
        return Err(status_error(status, detail));
    }

    if response.body.is_empty() {
        return Ok(None);
    }
    Ok(Some(response.json()?))
}

fn status_error(status: StatusCode, detail: String) -> PlexError {
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => PlexError::Auth(detail),
        _ => PlexError::Api {
            status: status.as_u16(),
            detail,
        },
    }
}

fn encode_segment(segment: &str) -> String {
    url::form_urlencoded::byte_serialize(segment.as_bytes()).collect()
}
