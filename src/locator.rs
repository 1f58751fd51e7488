use crate::config::BridgeConfig;
use crate::error::{PlexError, Result};
use crate::pending::PendingSlot;
use crate::protocol::{parse_resources, ResourceConnection, ResourceContainer};
use crate::transport::{plex_headers, HttpResponse, Transport};
use crate::types::{Credential, Endpoint, ServerIdentity, ServerSummary};
use reqwest::header::{HeaderValue, ACCEPT};
use reqwest::{Method, StatusCode};
use std::sync::{Arc, Mutex};
use url::Url;

/// Resolves a server identity to a reachable endpoint
///
/// The account's resource list is fetched, the advertised connections of the
/// matching server are probed in order, and the first candidate answering
/// `/system` with 200 wins. The result is memoized until [`invalidate`] is
/// called, and concurrent callers share one in-flight resolution.
///
/// [`invalidate`]: ServerLocator::invalidate
pub struct ServerLocator {
    transport: Transport,
    config: Arc<BridgeConfig>,
    credential: Credential,
    server: ServerIdentity,
    current: Arc<Mutex<Option<Endpoint>>>,
    resolution: PendingSlot<Endpoint>,
}

impl ServerLocator {
    pub fn new(
        transport: Transport,
        config: Arc<BridgeConfig>,
        credential: Credential,
        server: ServerIdentity,
    ) -> Self {
        Self {
            transport,
            config,
            credential,
            server,
            current: Arc::new(Mutex::new(None)),
            resolution: PendingSlot::new(),
        }
    }

    pub fn server(&self) -> &ServerIdentity {
        &self.server
    }

    /// The currently resolved endpoint, if any
    pub fn current(&self) -> Option<Endpoint> {
        self.current.lock().unwrap().clone()
    }

    /// Forget the resolved endpoint; the next caller re-resolves
    pub fn invalidate(&self) {
        if let Some(endpoint) = self.current.lock().unwrap().take() {
            tracing::info!("Invalidated endpoint {} for {}", endpoint, self.server.machine_identifier);
        }
    }

    /// Resolve the server to a reachable endpoint
    pub async fn resolve(&self) -> Result<Endpoint> {
        if let Some(endpoint) = self.current() {
            return Ok(endpoint);
        }

        let transport = self.transport.clone();
        let config = self.config.clone();
        let credential = self.credential.clone();
        let server = self.server.clone();
        let current = self.current.clone();

        self.resolution
            .run(move || async move {
                let endpoint = locate(&transport, &config, &credential, &server).await?;
                *current.lock().unwrap() = Some(endpoint.clone());
                Ok(endpoint)
            })
            .await
    }

    /// List every media server on the account
    pub async fn servers(&self) -> Result<Vec<ServerSummary>> {
        account_servers(&self.transport, &self.config, &self.credential).await
    }

    /// List the account's media servers before any server is paired
    pub async fn list_servers(
        config: &BridgeConfig,
        credential: &Credential,
    ) -> Result<Vec<ServerSummary>> {
        let transport = Transport::new(config.request_timeout())?;
        account_servers(&transport, config, credential).await
    }
}

async fn account_servers(
    transport: &Transport,
    config: &BridgeConfig,
    credential: &Credential,
) -> Result<Vec<ServerSummary>> {
    let resources = fetch_resources(transport, config, credential).await?;

    Ok(resources
        .devices
        .into_iter()
        .filter(|device| device.is_media_server())
        .map(|device| ServerSummary {
            name: device.name,
            machine_identifier: device.client_identifier,
            access_token: device.access_token,
        })
        .collect())
}

async fn locate(
    transport: &Transport,
    config: &BridgeConfig,
    credential: &Credential,
    server: &ServerIdentity,
) -> Result<Endpoint> {
    tracing::info!("Resolving server {}", server.machine_identifier);

    let resources = fetch_resources(transport, config, credential).await?;

    let device = resources
        .devices
        .into_iter()
        .find(|device| {
            device.is_media_server() && device.client_identifier == server.machine_identifier
        })
        .ok_or_else(|| {
            PlexError::ServerUnavailable(format!(
                "Server {} not in account anymore",
                server.machine_identifier
            ))
        })?;

    let candidates: Vec<Endpoint> = device
        .connections
        .iter()
        .filter_map(candidate_endpoint)
        .collect();

    tracing::debug!("Server {} has {} candidate(s)", device.name, candidates.len());

    for candidate in &candidates {
        if probe(transport, config, credential, candidate).await {
            tracing::info!("Resolved {} to {}", device.name, candidate);
            return Ok(candidate.clone());
        }
    }

    Err(PlexError::ServerUnavailable(format!(
        "No reachable connection for {} among {} candidate(s)",
        device.name,
        candidates.len()
    )))
}

async fn fetch_resources(
    transport: &Transport,
    config: &BridgeConfig,
    credential: &Credential,
) -> Result<ResourceContainer> {
    if credential.account_token.is_empty() {
        return Err(PlexError::MissingCredential);
    }

    let url = format!("{}/api/resources?includeHttps=1", config.account_base());
    let mut headers = plex_headers(
        Some(&credential.account_token),
        credential.client_identifier.as_str(),
        &config.product,
    )?;
    headers.insert(ACCEPT, HeaderValue::from_static("application/xml"));

    let response = transport
        .request(Method::GET, &url, headers, None, config.request_timeout())
        .await?;
    check_account_status(&response)?;

    parse_resources(&response.text())
}

fn check_account_status(response: &HttpResponse) -> Result<()> {
    match response.status {
        status if status.is_success() => Ok(()),
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            Err(PlexError::Auth(response.status_text()))
        }
        status => Err(PlexError::Api {
            status: status.as_u16(),
            detail: response.status_text(),
        }),
    }
}

/// Lightweight reachability check; any failure counts as unreachable
async fn probe(
    transport: &Transport,
    config: &BridgeConfig,
    credential: &Credential,
    candidate: &Endpoint,
) -> bool {
    let url = format!("{}/system", candidate.base_url());
    let headers = match plex_headers(
        Some(&credential.account_token),
        credential.client_identifier.as_str(),
        &config.product,
    ) {
        Ok(headers) => headers,
        Err(_) => return false,
    };

    match transport
        .request(Method::GET, &url, headers, None, config.probe_timeout())
        .await
    {
        Ok(response) if response.status == StatusCode::OK => true,
        Ok(response) => {
            tracing::debug!("Candidate {} answered {}", candidate, response.status);
            false
        }
        Err(e) => {
            tracing::debug!("Candidate {} unreachable: {}", candidate, e);
            false
        }
    }
}

/// Prefer the advertised URI, fall back to protocol/address/port
fn candidate_endpoint(connection: &ResourceConnection) -> Option<Endpoint> {
    if let Some(url) = connection.uri.as_deref().and_then(|uri| Url::parse(uri).ok()) {
        if let (Some(host), Some(port)) = (url.host_str(), url.port_or_known_default()) {
            return Some(Endpoint::new(url.scheme(), host, port));
        }
    }

    if connection.address.is_empty() || connection.port == 0 {
        return None;
    }
    let scheme = if connection.protocol.is_empty() {
        "http"
    } else {
        connection.protocol.as_str()
    };
    Some(Endpoint::new(scheme, connection.address.clone(), connection.port))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ClientIdentifier;
    use std::time::Duration;
    use wiremock::matchers::{header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const MACHINE: &str = "abc123";

    fn resources_xml(uris: &[String]) -> String {
        let connections: String = uris
            .iter()
            .map(|uri| format!(r#"<Connection protocol="http" address="127.0.0.1" port="1" uri="{uri}" local="1"/>"#))
            .collect();
        format!(
            r#"<MediaContainer size="2">
  <Device name="Phone" product="Plex for Android" provides="player" clientIdentifier="{MACHINE}"/>
  <Device name="Den" product="Plex Media Server" provides="server" clientIdentifier="{MACHINE}" accessToken="server-token">{connections}</Device>
</MediaContainer>"#
        )
    }

    async fn account_with(uris: &[String]) -> MockServer {
        let account = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/resources"))
            .and(query_param("includeHttps", "1"))
            .and(header("X-Plex-Token", "token"))
            .respond_with(ResponseTemplate::new(200).set_body_string(resources_xml(uris)))
            .mount(&account)
            .await;
        account
    }

    fn locator(account: &MockServer) -> ServerLocator {
        let config = BridgeConfig {
            account_base_url: account.uri(),
            probe_timeout_ms: 500,
            ..BridgeConfig::default()
        };
        ServerLocator::new(
            Transport::new(Duration::from_secs(2)).unwrap(),
            Arc::new(config),
            Credential::new("token", ClientIdentifier("test-client".into())),
            ServerIdentity::new(MACHINE),
        )
    }

    async fn candidate(status: u16, expected_probes: u64) -> MockServer {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/system"))
            .respond_with(ResponseTemplate::new(status))
            .expect(expected_probes)
            .mount(&server)
            .await;
        server
    }

    fn closed_port_uri() -> String {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        format!("http://127.0.0.1:{port}")
    }

    #[tokio::test]
    async fn first_reachable_candidate_wins_and_later_ones_are_not_probed() {
        let failing = candidate(500, 1).await;
        let winner = candidate(200, 1).await;
        let untouched = candidate(200, 0).await;
        let account = account_with(&[
            closed_port_uri(),
            failing.uri(),
            winner.uri(),
            untouched.uri(),
        ])
        .await;

        let locator = locator(&account);
        let endpoint = locator.resolve().await.unwrap();

        assert_eq!(endpoint.base_url(), winner.uri());
        assert_eq!(locator.current(), Some(endpoint));
    }

    #[tokio::test]
    async fn concurrent_resolves_share_one_attempt() {
        let winner = candidate(200, 1).await;
        let account = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/resources"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_string(resources_xml(&[winner.uri()]))
                    .set_delay(Duration::from_millis(100)),
            )
            .expect(1)
            .mount(&account)
            .await;

        let locator = Arc::new(locator(&account));
        let mut handles = Vec::new();
        for _ in 0..5 {
            let locator = locator.clone();
            handles.push(tokio::spawn(async move { locator.resolve().await }));
        }

        for handle in handles {
            assert_eq!(handle.await.unwrap().unwrap().base_url(), winner.uri());
        }
    }

    #[tokio::test]
    async fn invalidate_triggers_fresh_resolution() {
        let winner = candidate(200, 2).await;
        let account = account_with(&[winner.uri()]).await;
        let locator = locator(&account);

        locator.resolve().await.unwrap();
        locator.resolve().await.unwrap();
        locator.invalidate();
        assert!(locator.current().is_none());
        locator.resolve().await.unwrap();
    }

    #[tokio::test]
    async fn no_reachable_candidate_is_server_unavailable() {
        let failing = candidate(503, 1).await;
        let account = account_with(&[failing.uri()]).await;

        let err = locator(&account).resolve().await.unwrap_err();
        assert!(matches!(err, PlexError::ServerUnavailable(_)));
    }

    #[tokio::test]
    async fn unknown_server_is_server_unavailable() {
        let account = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/resources"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<MediaContainer size=\"0\"></MediaContainer>"))
            .mount(&account)
            .await;

        let err = locator(&account).resolve().await.unwrap_err();
        assert!(matches!(err, PlexError::ServerUnavailable(_)));
    }

    #[tokio::test]
    async fn rejected_token_is_auth_error() {
        let account = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/resources"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&account)
            .await;

        let err = locator(&account).resolve().await.unwrap_err();
        assert!(matches!(err, PlexError::Auth(_)));
    }

    #[tokio::test]
    async fn lists_media_servers_only() {
        let account = account_with(&[]).await;
        let servers = locator(&account).servers().await.unwrap();

        assert_eq!(servers.len(), 1);
        assert_eq!(servers[0].name, "Den");
        assert_eq!(servers[0].machine_identifier, MACHINE);
        assert_eq!(servers[0].access_token.as_deref(), Some("server-token"));
    }

    #[tokio::test]
    async fn lists_servers_without_a_paired_server() {
        let account = account_with(&[]).await;
        let config = BridgeConfig {
            account_base_url: account.uri(),
            ..BridgeConfig::default()
        };
        let credential = Credential::new("token", ClientIdentifier("test-client".into()));

        let servers = ServerLocator::list_servers(&config, &credential).await.unwrap();
        let names: Vec<&str> = servers.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["Den"]);
    }

    #[tokio::test]
    async fn listing_without_token_is_missing_credential() {
        let config = BridgeConfig::default();
        let credential = Credential::new("", ClientIdentifier("test-client".into()));

        let err = ServerLocator::list_servers(&config, &credential).await.unwrap_err();
        assert!(matches!(err, PlexError::MissingCredential));
    }

    #[test]
    fn candidate_falls_back_to_address() {
        let connection = ResourceConnection {
            protocol: "https".into(),
            address: "10.0.0.5".into(),
            port: 32400,
            uri: None,
        };
        assert_eq!(
            candidate_endpoint(&connection),
            Some(Endpoint::new("https", "10.0.0.5", 32400))
        );
    }
}
