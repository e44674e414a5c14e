// SPDX-License-Identifier: AGPL-3.0-only
// Copyright Authors of plunder

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::RwLock;
use tracing::info;

#[derive(thiserror::Error, Debug)]
pub enum AuthError {
    #[error("login request failed")]
    Request(#[from] reqwest::Error),
    #[error("login rejected with status {0}")]
    Rejected(u16),
}

/// Where the dialer gets the token it attaches to the handshake. When the
/// server rejects the token the dialer asks for a refresh and tries again.
#[async_trait]
pub trait TokenSource: Send + Sync {
    fn token(&self) -> String;
    async fn refresh(&self) -> Result<String, AuthError>;
}

/// A pre-shared token. Refreshing hands back the same value; if the server
/// keeps rejecting it the dial attempt fails and the breaker takes over.
pub struct StaticToken {
    token: String,
}

impl StaticToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }
}

#[async_trait]
impl TokenSource for StaticToken {
    fn token(&self) -> String {
        self.token.clone()
    }

    async fn refresh(&self) -> Result<String, AuthError> {
        Ok(self.token.clone())
    }
}

#[derive(Serialize)]
struct LoginRequest<'a> {
    password: &'a str,
}

#[derive(Deserialize)]
struct LoginResponse {
    token: String,
}

/// Exchanges an operator password for a token and re-runs the exchange
/// whenever the current token stops being accepted.
pub struct PasswordSession {
    login_url: String,
    password: String,
    client: reqwest::Client,
    token: RwLock<String>,
}

impl PasswordSession {
    pub fn new(login_url: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            login_url: login_url.into(),
            password: password.into(),
            client: reqwest::Client::new(),
            token: RwLock::new(String::new()),
        }
    }
}

#[async_trait]
impl TokenSource for PasswordSession {
    fn token(&self) -> String {
        self.token.read().unwrap().clone()
    }

    async fn refresh(&self) -> Result<String, AuthError> {
        let response = self
            .client
            .post(&self.login_url)
            .json(&LoginRequest {
                password: &self.password,
            })
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(AuthError::Rejected(status.as_u16()));
        }

        let body: LoginResponse = response.json().await?;
        info!("obtained a fresh session token");
        *self.token.write().unwrap() = body.token.clone();
        Ok(body.token)
    }
}
