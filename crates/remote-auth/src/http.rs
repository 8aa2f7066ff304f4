//! Ticket-to-token exchange against the REST API.

use {async_trait::async_trait, serde::Deserialize, std::time::Duration};

#[derive(Debug, thiserror::Error)]
pub enum ExchangeError {
    #[error("ticket exchange request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("ticket exchange response carried no encrypted token")]
    MissingToken,
}

/// The HTTP collaborator that turns a login ticket into an encrypted token.
/// Abstracted so tests can script the exchange without a server.
#[async_trait]
pub trait TicketExchanger: Send + Sync {
    async fn exchange(&self, ticket: &str) -> Result<String, ExchangeError>;
}

#[derive(Debug, Deserialize)]
struct ExchangeResponse {
    encrypted_token: Option<String>,
}

/// Production exchanger: `POST {endpoint}` with `{"ticket": ...}`, expecting
/// `{"encrypted_token": ...}` back.
#[derive(Debug, Clone)]
pub struct RestTicketExchanger {
    client: reqwest::Client,
    endpoint: String,
}

impl RestTicketExchanger {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(30))
                .build()
                .unwrap_or_default(),
            endpoint: endpoint.into(),
        }
    }

    pub fn with_client(client: reqwest::Client, endpoint: impl Into<String>) -> Self {
        Self {
            client,
            endpoint: endpoint.into(),
        }
    }
}

#[async_trait]
impl TicketExchanger for RestTicketExchanger {
    async fn exchange(&self, ticket: &str) -> Result<String, ExchangeError> {
        let response = self
            .client
            .post(&self.endpoint)
            .json(&serde_json::json!({ "ticket": ticket }))
            .send()
            .await?
            .error_for_status()?;
        let body: ExchangeResponse = response.json().await?;
        body.encrypted_token.ok_or(ExchangeError::MissingToken)
    }
}
