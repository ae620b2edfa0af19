// Copyright 2025 AgentReplay (https://github.com/agentreplay)
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

//! Bearer token providers for the agent transport

use async_trait::async_trait;
use convoeval_core::AuthConfig;
use serde::Deserialize;
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

pub const DEFAULT_AUTHORITY: &str = "https://login.microsoftonline.com";

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("Missing credential: {0}")]
    MissingCredential(&'static str),

    #[error("Token request rejected ({status}): {body}")]
    Rejected { status: u16, body: String },

    #[error("Invalid token response: {0}")]
    InvalidResponse(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

/// Source of bearer tokens for the agent.
#[async_trait]
pub trait TokenProvider: Send + Sync {
    async fn acquire_token(&self) -> Result<String, AuthError>;
}

/// Hands out a pre-issued token.
pub struct StaticTokenProvider {
    token: String,
}

impl StaticTokenProvider {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }
}

#[async_trait]
impl TokenProvider for StaticTokenProvider {
    async fn acquire_token(&self) -> Result<String, AuthError> {
        if self.token.is_empty() {
            return Err(AuthError::MissingCredential("token"));
        }
        Ok(self.token.clone())
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: Option<String>,
}

/// OAuth2 client-credentials flow against the Microsoft identity platform.
///
/// Every call performs a fresh token request.
pub struct ClientCredentialsTokenProvider {
    client: reqwest::Client,
    authority: String,
    tenant_id: String,
    client_id: String,
    client_secret: String,
    scope: String,
}

impl ClientCredentialsTokenProvider {
    pub fn new(
        tenant_id: impl Into<String>,
        client_id: impl Into<String>,
        client_secret: impl Into<String>,
        scope: impl Into<String>,
    ) -> Self {
        Self {
            client: reqwest::Client::new(),
            authority: DEFAULT_AUTHORITY.to_string(),
            tenant_id: tenant_id.into(),
            client_id: client_id.into(),
            client_secret: client_secret.into(),
            scope: scope.into(),
        }
    }

    /// Override the authority host (sovereign clouds, tests)
    pub fn with_authority(mut self, authority: impl Into<String>) -> Self {
        self.authority = authority.into().trim_end_matches('/').to_string();
        self
    }

    fn token_url(&self) -> String {
        format!("{}/{}/oauth2/v2.0/token", self.authority, self.tenant_id)
    }
}

#[async_trait]
impl TokenProvider for ClientCredentialsTokenProvider {
    async fn acquire_token(&self) -> Result<String, AuthError> {
        let url = self.token_url();
        debug!("Requesting client-credentials token from {}", url);

        let params = [
            ("grant_type", "client_credentials"),
            ("client_id", self.client_id.as_str()),
            ("client_secret", self.client_secret.as_str()),
            ("scope", self.scope.as_str()),
        ];

        let response = self.client.post(&url).form(&params).send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(AuthError::Rejected {
                status: status.as_u16(),
                body,
            });
        }

        let token: TokenResponse = response.json().await?;
        token
            .access_token
            .filter(|t| !t.is_empty())
            .ok_or_else(|| AuthError::InvalidResponse("missing access_token".to_string()))
    }
}

/// Pick a token provider for the configured credentials.
///
/// A static token wins; otherwise the client-credentials flow needs
/// tenant, client id and secret.
pub fn provider_from_config(auth: &AuthConfig) -> Result<Arc<dyn TokenProvider>, AuthError> {
    if let Some(token) = auth.token.as_deref().filter(|t| !t.is_empty()) {
        return Ok(Arc::new(StaticTokenProvider::new(token)));
    }

    let tenant_id = auth
        .tenant_id
        .clone()
        .ok_or(AuthError::MissingCredential("tenant_id"))?;
    let client_id = auth
        .client_id
        .clone()
        .ok_or(AuthError::MissingCredential("client_id"))?;
    let client_secret = auth
        .client_secret
        .clone()
        .ok_or(AuthError::MissingCredential("client_secret"))?;

    Ok(Arc::new(ClientCredentialsTokenProvider::new(
        tenant_id,
        client_id,
        client_secret,
        auth.scope.clone(),
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::Matcher;

    #[tokio::test]
    async fn test_static_token() {
        let provider = StaticTokenProvider::new("abc");
        assert_eq!(provider.acquire_token().await.unwrap(), "abc");

        let empty = StaticTokenProvider::new("");
        assert!(matches!(
            empty.acquire_token().await,
            Err(AuthError::MissingCredential("token"))
        ));
    }

    #[tokio::test]
    async fn test_client_credentials_flow() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/tenant-1/oauth2/v2.0/token")
            .match_body(Matcher::AllOf(vec![
                Matcher::UrlEncoded("grant_type".into(), "client_credentials".into()),
                Matcher::UrlEncoded("client_id".into(), "app".into()),
                Matcher::UrlEncoded("client_secret".into(), "s3cret".into()),
            ]))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"token_type":"Bearer","expires_in":3599,"access_token":"tok-123"}"#)
            .create_async()
            .await;

        let provider = ClientCredentialsTokenProvider::new(
            "tenant-1",
            "app",
            "s3cret",
            "https://api.powerplatform.com/.default",
        )
        .with_authority(server.url());

        assert_eq!(provider.acquire_token().await.unwrap(), "tok-123");
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_client_credentials_rejected() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/tenant-1/oauth2/v2.0/token")
            .with_status(401)
            .with_body(r#"{"error":"invalid_client"}"#)
            .create_async()
            .await;

        let provider = ClientCredentialsTokenProvider::new("tenant-1", "app", "bad", "scope")
            .with_authority(server.url());

        match provider.acquire_token().await {
            Err(AuthError::Rejected { status, body }) => {
                assert_eq!(status, 401);
                assert!(body.contains("invalid_client"));
            }
            other => panic!("expected rejection, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_provider_from_config() {
        let mut auth = AuthConfig::default();
        assert!(matches!(
            provider_from_config(&auth),
            Err(AuthError::MissingCredential("tenant_id"))
        ));

        auth.tenant_id = Some("t".to_string());
        auth.client_id = Some("c".to_string());
        assert!(matches!(
            provider_from_config(&auth),
            Err(AuthError::MissingCredential("client_secret"))
        ));

        auth.client_secret = Some("s".to_string());
        assert!(provider_from_config(&auth).is_ok());

        let static_only = AuthConfig {
            token: Some("pre-issued".to_string()),
            ..Default::default()
        };
        assert!(provider_from_config(&static_only).is_ok());
    }
}
