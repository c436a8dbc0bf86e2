use cove_proto::{
    ClusterPayload, CreateSessionRequest, HeartbeatRequest, HeartbeatResponse, SessionInfo,
};
use parking_lot::RwLock;
use reqwest::redirect::Policy;
use reqwest::{Response, StatusCode};
use sha2::{Digest, Sha256};
use std::time::Duration;
use url::Url;

use crate::error::HostError;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// HTTP/websocket endpoint for one host.
///
/// Redirects are never followed: a redirect out of an API call is an
/// access gateway bouncing us to its login page, and following it would
/// mask that as a parse error.
pub struct HostClient {
    pub id: String,
    base_url: Url,
    token: RwLock<Option<String>>,
    http: reqwest::Client,
}

impl HostClient {
    pub fn new(id: impl Into<String>, base_url: &str) -> Result<Self, HostError> {
        let base_url = normalize_base_url(base_url)?;
        let http = reqwest::Client::builder()
            .redirect(Policy::none())
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| HostError::Transient(e.to_string()))?;
        Ok(Self {
            id: id.into(),
            base_url,
            token: RwLock::new(None),
            http,
        })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// Stable identity of the endpoint, independent of path or trailing
    /// slash spelling. Two hosts with the same key are the same host.
    pub fn endpoint_key(&self) -> String {
        endpoint_key(&self.base_url)
    }

    pub fn token(&self) -> Option<String> {
        self.token.read().clone()
    }

    pub fn set_token(&self, token: Option<String>) {
        *self.token.write() = token;
    }

    /// Derive and store the bearer token from a password. The password
    /// itself never goes over the wire.
    pub fn login(&self, password: &str) {
        let mut hasher = Sha256::new();
        hasher.update(password.as_bytes());
        self.set_token(Some(format!("{:x}", hasher.finalize())));
    }

    pub fn ws_url(&self, session_id: &str) -> Result<Url, HostError> {
        let mut url = self
            .base_url
            .join(&format!("ws/{session_id}"))
            .map_err(|e| HostError::Protocol(e.to_string()))?;
        let scheme = if url.scheme() == "https" { "wss" } else { "ws" };
        url.set_scheme(scheme)
            .map_err(|_| HostError::Protocol("unsupported scheme".into()))?;
        if let Some(token) = self.token() {
            url.query_pairs_mut().append_pair("token", &token);
        }
        Ok(url)
    }

    pub async fn heartbeat(&self, req: &HeartbeatRequest) -> Result<HeartbeatResponse, HostError> {
        let response = self
            .http
            .post(self.api_url("api/heartbeat")?)
            .bearer_auth(self.token().unwrap_or_default())
            .json(req)
            .send()
            .await
            .map_err(|e| HostError::Transient(e.to_string()))?;
        parse_json(self.classify(response).await?).await
    }

    pub async fn create_session(&self, cwd: Option<String>) -> Result<SessionInfo, HostError> {
        let response = self
            .http
            .post(self.api_url("api/sessions")?)
            .bearer_auth(self.token().unwrap_or_default())
            .json(&CreateSessionRequest { cwd })
            .send()
            .await
            .map_err(|e| HostError::Transient(e.to_string()))?;
        parse_json(self.classify(response).await?).await
    }

    pub async fn delete_session(&self, session_id: &str) -> Result<(), HostError> {
        let response = self
            .http
            .delete(self.api_url(&format!("api/sessions/{session_id}"))?)
            .bearer_auth(self.token().unwrap_or_default())
            .send()
            .await
            .map_err(|e| HostError::Transient(e.to_string()))?;
        self.classify(response).await?;
        Ok(())
    }

    pub async fn get_cluster(&self) -> Result<ClusterPayload, HostError> {
        let response = self
            .http
            .get(self.api_url("api/cluster")?)
            .bearer_auth(self.token().unwrap_or_default())
            .send()
            .await
            .map_err(|e| HostError::Transient(e.to_string()))?;
        parse_json(self.classify(response).await?).await
    }

    pub async fn put_cluster(&self, payload: &ClusterPayload) -> Result<(), HostError> {
        let response = self
            .http
            .put(self.api_url("api/cluster")?)
            .bearer_auth(self.token().unwrap_or_default())
            .json(payload)
            .send()
            .await
            .map_err(|e| HostError::Transient(e.to_string()))?;
        self.classify(response).await?;
        Ok(())
    }

    fn api_url(&self, path: &str) -> Result<Url, HostError> {
        self.base_url
            .join(path)
            .map_err(|e| HostError::Protocol(e.to_string()))
    }

    /// Map an HTTP response to the recovery taxonomy.
    async fn classify(&self, response: Response) -> Result<Response, HostError> {
        let status = response.status();
        if status.is_redirection() {
            let location = response
                .headers()
                .get(reqwest::header::LOCATION)
                .and_then(|v| v.to_str().ok())
                .unwrap_or("")
                .to_string();
            if gateway_login_url(&location) {
                return Err(HostError::GatewayRedirect {
                    login_url: location,
                });
            }
            return Err(HostError::Transient(format!(
                "unexpected redirect to {location}"
            )));
        }
        match status {
            StatusCode::UNAUTHORIZED => Err(HostError::Unauthorized),
            StatusCode::FORBIDDEN => Err(HostError::Locked),
            s if s.is_success() => {
                // A gateway that serves its login page with 200 instead
                // of redirecting still gives itself away by answering an
                // API call with HTML.
                let html = response
                    .headers()
                    .get(reqwest::header::CONTENT_TYPE)
                    .and_then(|v| v.to_str().ok())
                    .map(|ct| ct.starts_with("text/html"))
                    .unwrap_or(false);
                if html {
                    return Err(HostError::GatewayRedirect {
                        login_url: self.base_url.to_string(),
                    });
                }
                Ok(response)
            }
            s => Err(HostError::Transient(format!("http status {s}"))),
        }
    }
}

async fn parse_json<T: serde::de::DeserializeOwned>(response: Response) -> Result<T, HostError> {
    response
        .json()
        .await
        .map_err(|e| HostError::Protocol(e.to_string()))
}

/// True when a redirect target looks like an access-gateway login flow
/// rather than an application redirect.
pub fn gateway_login_url(location: &str) -> bool {
    location.contains("cloudflareaccess.com") || location.contains("/cdn-cgi/access/")
}

pub fn normalize_base_url(raw: &str) -> Result<Url, HostError> {
    let with_scheme = if raw.contains("://") {
        raw.to_string()
    } else {
        format!("http://{raw}")
    };
    let mut url = Url::parse(&with_scheme).map_err(|e| HostError::Protocol(e.to_string()))?;
    if url.scheme() != "http" && url.scheme() != "https" {
        return Err(HostError::Protocol(format!(
            "unsupported scheme {}",
            url.scheme()
        )));
    }
    // Paths are not part of a host identity; keep a bare origin with a
    // trailing slash so join() behaves.
    url.set_path("/");
    url.set_query(None);
    url.set_fragment(None);
    Ok(url)
}

pub fn endpoint_key(url: &Url) -> String {
    let port = url
        .port_or_known_default()
        .map(|p| p.to_string())
        .unwrap_or_default();
    format!(
        "{}://{}:{}",
        url.scheme(),
        url.host_str().unwrap_or_default(),
        port
    )
}
