use crate::client::PlexClient;
use crate::error::Result;
use crate::types::{Session, SessionKey};
use std::collections::HashMap;
use tokio::sync::Mutex;

/// Memoized session lookups, scoped to one notification connection
///
/// A play session emits many notifications; only the first one for a key
/// pays for the full session-list fetch. The cache is cleared wholesale when
/// the connection drops since session keys are not stable across reconnects.
#[derive(Default)]
pub struct SessionCache {
    sessions: Mutex<HashMap<SessionKey, Session>>,
}

impl SessionCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up a session, fetching it on first use
    ///
    /// Fails with `SessionNotFound` when the key is not in the current list.
    pub async fn get_cached(&self, client: &PlexClient, session_key: &str) -> Result<Session> {
        if let Some(session) = self.sessions.lock().await.get(session_key) {
            return Ok(session.clone());
        }

        let session = client.session(session_key).await?;
        tracing::debug!("Cached session {} ({:?})", session_key, session.media_title);
        self.sessions
            .lock()
            .await
            .insert(session_key.to_string(), session.clone());
        Ok(session)
    }

    pub async fn clear(&self) {
        self.sessions.lock().await.clear();
    }

    pub async fn len(&self) -> usize {
        self.sessions.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.lock().await.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BridgeConfig;
    use crate::error::PlexError;
    use crate::types::{ClientIdentifier, Credential, ServerIdentity};
    use serde_json::json;
    use std::sync::Arc;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn repeated_lookups_hit_the_server_once() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/system"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/status/sessions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "MediaContainer": {"Metadata": [{"sessionKey": "4", "title": "Heat",
                    "Player": {"title": "TV"}, "User": {"title": "kim"}}]}
            })))
            .expect(2)
            .mount(&server)
            .await;

        let account = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/resources"))
            .respond_with(ResponseTemplate::new(200).set_body_string(format!(
                r#"<MediaContainer><Device product="Plex Media Server" clientIdentifier="m"><Connection uri="{}"/></Device></MediaContainer>"#,
                server.uri()
            )))
            .mount(&account)
            .await;

        let config = BridgeConfig {
            account_base_url: account.uri(),
            ..BridgeConfig::default()
        };
        let client = PlexClient::new(
            Arc::new(config),
            Credential::new("token", ClientIdentifier("c".into())),
            ServerIdentity::new("m"),
        )
        .unwrap();

        let cache = SessionCache::new();
        let first = cache.get_cached(&client, "4").await.unwrap();
        let second = cache.get_cached(&client, "4").await.unwrap();
        assert_eq!(first, second);
        assert_eq!(cache.len().await, 1);

        // a miss queries again and is not cached
        let err = cache.get_cached(&client, "5").await.unwrap_err();
        assert!(matches!(err, PlexError::SessionNotFound(_)));

        cache.clear().await;
        assert!(cache.is_empty().await);
    }
}
