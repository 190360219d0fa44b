//! HTTP client for the gateway's expose/unexpose control API.
//!
//! The gateway (host-switch) exposes two endpoints that bind or release a
//! host port forwarding to a guest address. Success is HTTP 200; any other
//! status carries a plain-text explanation in the body.

use std::time::Duration;

use async_trait::async_trait;
use portbridge_portmap::{ExposeRequest, PortMapping, UnexposeRequest};
use reqwest::StatusCode;
use tracing::debug;

use crate::error::ForwarderError;
use crate::forwarder::Forwarder;

pub const EXPOSE_API: &str = "/services/forwarder/expose";
pub const UNEXPOSE_API: &str = "/services/forwarder/unexpose";

/// Request budget for a single gateway call.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Client for the gateway's port-forwarding control API.
#[derive(Clone)]
pub struct GatewayClient {
    base_url: String,
    http: reqwest::Client,
}

impl GatewayClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .expect("default reqwest client");

        Self {
            base_url: base_url.into(),
            http,
        }
    }

    /// Bind a host port and forward it to the guest.
    pub async fn expose(&self, request: &ExposeRequest) -> Result<(), ForwarderError> {
        debug!(local = %request.local, remote = %request.remote, "calling expose API");
        let response = self
            .http
            .post(self.url(EXPOSE_API))
            .json(request)
            .send()
            .await?;

        verify_response(response).await
    }

    /// Release a previously exposed host port.
    pub async fn unexpose(&self, request: &UnexposeRequest) -> Result<(), ForwarderError> {
        debug!(local = %request.local, "calling unexpose API");
        let response = self
            .http
            .post(self.url(UNEXPOSE_API))
            .json(request)
            .send()
            .await?;

        verify_response(response).await
    }

    fn url(&self, api: &str) -> String {
        format!("{}{}", self.base_url.trim_end_matches('/'), api)
    }
}

async fn verify_response(response: reqwest::Response) -> Result<(), ForwarderError> {
    let status = response.status();
    if status == StatusCode::OK {
        return Ok(());
    }

    let body = response.text().await.unwrap_or_default();
    Err(ForwarderError::GatewayStatus {
        status: status.as_u16(),
        body: body.trim().to_string(),
    })
}

/// Adapts the gateway HTTP API to the [`Forwarder`] contract: one
/// expose/unexpose request per port binding, forwarding to the given
/// upstream guest address at the same port.
pub struct GatewayForwarder {
    client: GatewayClient,
    upstream_ip: String,
}

impl GatewayForwarder {
    pub fn new(client: GatewayClient, upstream_ip: impl Into<String>) -> Self {
        Self {
            client,
            upstream_ip: upstream_ip.into(),
        }
    }
}

#[async_trait]
impl Forwarder for GatewayForwarder {
    async fn send(&self, mapping: PortMapping) -> Result<(), ForwarderError> {
        for (key, bindings) in &mapping.ports {
            for binding in bindings {
                if mapping.remove {
                    self.client
                        .unexpose(&UnexposeRequest {
                            local: binding.addr(),
                            protocol: key.protocol.as_str().to_string(),
                        })
                        .await?;
                } else {
                    self.client
                        .expose(&ExposeRequest {
                            local: binding.addr(),
                            remote: format!("{}:{}", self.upstream_ip, binding.host_port),
                            protocol: key.protocol.as_str().to_string(),
                        })
                        .await?;
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn test_expose_posts_json_body() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(EXPOSE_API))
            .and(body_json(serde_json::json!({
                "local": "127.0.0.1:8080",
                "remote": "192.168.127.2:8080",
                "protocol": "tcp",
            })))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let client = GatewayClient::new(server.uri());
        client
            .expose(&ExposeRequest {
                local: "127.0.0.1:8080".to_string(),
                remote: "192.168.127.2:8080".to_string(),
                protocol: "tcp".to_string(),
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_non_200_carries_body_text() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(UNEXPOSE_API))
            .respond_with(ResponseTemplate::new(500).set_body_string("port not bound\n"))
            .mount(&server)
            .await;

        let client = GatewayClient::new(server.uri());
        let err = client
            .unexpose(&UnexposeRequest {
                local: "127.0.0.1:8080".to_string(),
                protocol: "tcp".to_string(),
            })
            .await
            .unwrap_err();

        match err {
            ForwarderError::GatewayStatus { status, body } => {
                assert_eq!(status, 500);
                assert_eq!(body, "port not bound");
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}
