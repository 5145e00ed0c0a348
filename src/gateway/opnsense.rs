//! OPNsense WireGuard client API over HTTPS with key/secret basic auth.

use std::time::Duration;

use async_trait::async_trait;
use facet::Facet;
use reqwest::StatusCode;
use reqwest::header::CONTENT_TYPE;

use super::{PeerRecord, VpnGateway, host_address, tunnel_address_matches};
use crate::error::LabError;

const REQUEST_TIMEOUT_SECS: u64 = 30;

// ── wire types ─────────────────────────────────────────────

#[derive(Debug, Facet)]
struct SearchRequest {
    current: u32,
    #[facet(rename = "rowCount")]
    row_count: i64,
    #[facet(rename = "searchPhrase")]
    search_phrase: String,
}

#[derive(Debug, Default, Facet)]
#[facet(default)]
struct SearchResponse {
    #[facet(default)]
    rows: Vec<ClientRow>,
}

#[derive(Debug, Default, Facet)]
#[facet(default)]
struct ClientRow {
    #[facet(default)]
    uuid: String,
    #[facet(default)]
    name: String,
    #[facet(default)]
    pubkey: String,
    #[facet(default)]
    tunneladdress: String,
    #[facet(default)]
    servers: String,
}

#[derive(Debug, Facet)]
struct ClientEnvelope {
    client: ClientFields,
}

#[derive(Debug, Facet)]
struct ClientFields {
    enabled: String,
    name: String,
    pubkey: String,
    tunneladdress: String,
    #[facet(skip_serializing_if = Option::is_none)]
    servers: Option<String>,
    #[facet(skip_serializing_if = Option::is_none)]
    keepalive: Option<String>,
}

#[derive(Debug, Default, Facet)]
#[facet(default)]
struct MutationResponse {
    #[facet(default)]
    result: String,
}

// ── client ─────────────────────────────────────────────────

pub struct OpnsenseClient {
    base_url: String,
    api_key: String,
    api_secret: String,
    http: reqwest::Client,
}

impl OpnsenseClient {
    /// `insecure` disables certificate verification for self-signed firewalls.
    pub fn new(
        base_url: &str,
        api_key: &str,
        api_secret: &str,
        insecure: bool,
    ) -> Result<Self, LabError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .danger_accept_invalid_certs(insecure)
            .build()
            .map_err(|e| LabError::VpnTransport {
                message: format!("failed to build HTTP client: {e}"),
            })?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            api_secret: api_secret.to_string(),
            http,
        })
    }

    async fn post(&self, path: &str, body: Option<String>) -> Result<(StatusCode, String), LabError> {
        let url = format!("{}{path}", self.base_url);
        let mut request = self
            .http
            .post(&url)
            .basic_auth(&self.api_key, Some(&self.api_secret));
        if let Some(body) = body {
            request = request.header(CONTENT_TYPE, "application/json").body(body);
        }
        let response = request.send().await.map_err(|e| LabError::VpnTransport {
            message: format!("POST {path}: {e}"),
        })?;
        let status = response.status();
        let text = response.text().await.map_err(|e| LabError::VpnTransport {
            message: format!("reading response of {path}: {e}"),
        })?;
        Ok((status, text))
    }

    /// Send a create/update and insist on `{"result":"saved"}`; a 200 carrying
    /// validation errors is still a rejection.
    async fn mutate(&self, operation: &str, path: &str, envelope: &ClientEnvelope) -> Result<(), LabError> {
        let body = facet_json::to_string(envelope).map_err(|e| LabError::VpnTransport {
            message: format!("failed to encode {operation} request: {e}"),
        })?;
        let (status, text) = self.post(path, Some(body)).await?;
        if !status.is_success() {
            return Err(LabError::VpnRejected {
                operation: operation.to_string(),
                message: format!("HTTP {}: {}", status.as_u16(), text.trim()),
            });
        }
        let parsed: MutationResponse = facet_json::from_str(&text).map_err(|e| LabError::VpnRejected {
            operation: operation.to_string(),
            message: format!("unreadable response ({e}): {}", text.trim()),
        })?;
        if parsed.result != "saved" {
            return Err(LabError::VpnRejected {
                operation: operation.to_string(),
                message: text.trim().to_string(),
            });
        }
        tracing::debug!(operation, "gateway accepted change");
        self.reconfigure().await
    }

    /// Apply pending WireGuard changes on the firewall.
    async fn reconfigure(&self) -> Result<(), LabError> {
        let (status, _) = self.post("/api/wireguard/service/reconfigure", None).await?;
        if status != StatusCode::OK {
            return Err(LabError::VpnTransport {
                message: format!("reconfigure returned status {}", status.as_u16()),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl VpnGateway for OpnsenseClient {
    async fn find_peer_by_tunnel_address(
        &self,
        address: &str,
    ) -> Result<Option<PeerRecord>, LabError> {
        let request = SearchRequest {
            current: 1,
            row_count: -1,
            search_phrase: host_address(address).to_string(),
        };
        let body = facet_json::to_string(&request).map_err(|e| LabError::VpnTransport {
            message: format!("failed to encode search request: {e}"),
        })?;
        let (status, text) = self
            .post("/api/wireguard/client/search_client", Some(body))
            .await?;
        if !status.is_success() {
            return Err(LabError::VpnTransport {
                message: format!("search_client returned status {}", status.as_u16()),
            });
        }
        let parsed: SearchResponse = facet_json::from_str(&text).map_err(|e| LabError::VpnTransport {
            message: format!("invalid search_client response: {e}"),
        })?;

        Ok(parsed
            .rows
            .into_iter()
            .find(|row| tunnel_address_matches(&row.tunneladdress, address))
            .map(|row| PeerRecord {
                id: row.uuid,
                name: row.name,
                public_key: row.pubkey,
                tunnel_address: row.tunneladdress,
                servers: row.servers,
            }))
    }

    async fn update_peer(&self, peer: &PeerRecord) -> Result<(), LabError> {
        let envelope = ClientEnvelope {
            client: ClientFields {
                enabled: "1".into(),
                name: peer.name.clone(),
                pubkey: peer.public_key.clone(),
                tunneladdress: peer.tunnel_address.clone(),
                servers: Some(peer.servers.clone()),
                keepalive: None,
            },
        };
        let path = format!("/api/wireguard/client/set_client/{}", peer.id);
        self.mutate("set_client", &path, &envelope).await
    }

    async fn create_peer(
        &self,
        name: &str,
        public_key: &str,
        tunnel_address: &str,
        keepalive: u32,
    ) -> Result<(), LabError> {
        let envelope = ClientEnvelope {
            client: ClientFields {
                enabled: "1".into(),
                name: name.to_string(),
                pubkey: public_key.to_string(),
                tunneladdress: tunnel_address.to_string(),
                servers: None,
                keepalive: (keepalive > 0).then(|| keepalive.to_string()),
            },
        };
        self.mutate("add_client", "/api/wireguard/client/add_client", &envelope)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::prelude::*;

    // base64("key:secret")
    const AUTH: &str = "Basic a2V5OnNlY3JldA==";

    fn client(server: &MockServer) -> OpnsenseClient {
        OpnsenseClient::new(&server.base_url(), "key", "secret", false).unwrap()
    }

    fn record() -> PeerRecord {
        PeerRecord {
            id: "uuid-1".into(),
            name: "student1".into(),
            public_key: "NEWKEY".into(),
            tunnel_address: "10.0.0.2/32".into(),
            servers: "server-uuid-1".into(),
        }
    }

    #[tokio::test]
    async fn finds_peer_by_exact_address() {
        let server = MockServer::start_async().await;
        let search = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/api/wireguard/client/search_client")
                    .header("authorization", AUTH)
                    .body_includes("10.0.0.2");
                then.status(200).body(
                    r#"{"rows":[
                        {"uuid":"uuid-20","name":"near-miss","pubkey":"K20","tunneladdress":"10.0.0.20/32","servers":"s"},
                        {"uuid":"uuid-2","name":"student1","pubkey":"K2","tunneladdress":"10.0.0.2/32","servers":"server-uuid-1","enabled":"1"}
                    ],"rowCount":2,"total":2,"current":1}"#,
                );
            })
            .await;

        let found = client(&server)
            .find_peer_by_tunnel_address("10.0.0.2/32")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.id, "uuid-2");
        assert_eq!(found.public_key, "K2");
        assert_eq!(found.servers, "server-uuid-1");
        search.assert_calls_async(1).await;
    }

    #[tokio::test]
    async fn no_matching_row() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/api/wireguard/client/search_client");
                then.status(200).body(r#"{"rows":[],"rowCount":0,"total":0,"current":1}"#);
            })
            .await;
        let found = client(&server)
            .find_peer_by_tunnel_address("10.0.0.9")
            .await
            .unwrap();
        assert!(found.is_none());
    }

    #[tokio::test]
    async fn search_http_error_is_transport_error() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/api/wireguard/client/search_client");
                then.status(401).body("unauthorized");
            })
            .await;
        let err = client(&server)
            .find_peer_by_tunnel_address("10.0.0.2")
            .await
            .unwrap_err();
        assert!(matches!(err, LabError::VpnTransport { .. }));
        assert!(err.to_string().contains("401"));
    }

    #[tokio::test]
    async fn update_then_reconfigure() {
        let server = MockServer::start_async().await;
        let update = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/api/wireguard/client/set_client/uuid-1")
                    .header("authorization", AUTH)
                    .body_includes("NEWKEY")
                    .body_includes("server-uuid-1")
                    .body_includes("student1");
                then.status(200).body(r#"{"result":"saved"}"#);
            })
            .await;
        let reconfigure = server
            .mock_async(|when, then| {
                when.method(POST).path("/api/wireguard/service/reconfigure");
                then.status(200).body(r#"{"status":"ok"}"#);
            })
            .await;

        client(&server).update_peer(&record()).await.unwrap();
        update.assert_calls_async(1).await;
        reconfigure.assert_calls_async(1).await;
    }

    #[tokio::test]
    async fn validation_errors_with_200_are_rejections() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/api/wireguard/client/set_client/uuid-1");
                then.status(200)
                    .body(r#"{"result":"failed","validations":{"client.pubkey":"invalid key"}}"#);
            })
            .await;
        let reconfigure = server
            .mock_async(|when, then| {
                when.method(POST).path("/api/wireguard/service/reconfigure");
                then.status(200);
            })
            .await;

        let err = client(&server).update_peer(&record()).await.unwrap_err();
        assert!(matches!(err, LabError::VpnRejected { .. }));
        assert!(err.to_string().contains("invalid key"));
        reconfigure.assert_calls_async(0).await;
    }

    #[tokio::test]
    async fn create_omits_zero_keepalive() {
        let server = MockServer::start_async().await;
        let add = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/api/wireguard/client/add_client")
                    .body_includes("10.0.0.5/32")
                    .body_excludes("keepalive");
                then.status(200).body(r#"{"result":"saved","uuid":"new-uuid"}"#);
            })
            .await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/api/wireguard/service/reconfigure");
                then.status(200);
            })
            .await;

        client(&server)
            .create_peer("student5", "KEY5", "10.0.0.5/32", 0)
            .await
            .unwrap();
        add.assert_calls_async(1).await;
    }

    #[tokio::test]
    async fn create_sends_keepalive() {
        let server = MockServer::start_async().await;
        let add = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/api/wireguard/client/add_client")
                    .body_includes("keepalive")
                    .body_includes("\"25\"");
                then.status(200).body(r#"{"result":"saved"}"#);
            })
            .await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/api/wireguard/service/reconfigure");
                then.status(200);
            })
            .await;

        client(&server)
            .create_peer("student5", "KEY5", "10.0.0.5/32", 25)
            .await
            .unwrap();
        add.assert_calls_async(1).await;
    }

    #[tokio::test]
    async fn failed_reconfigure_is_reported() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/api/wireguard/client/set_client/uuid-1");
                then.status(200).body(r#"{"result":"saved"}"#);
            })
            .await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/api/wireguard/service/reconfigure");
                then.status(500);
            })
            .await;

        let err = client(&server).update_peer(&record()).await.unwrap_err();
        assert!(err.to_string().contains("reconfigure returned status 500"));
    }
}
