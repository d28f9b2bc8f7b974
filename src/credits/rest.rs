//! PostgREST balance authority
//!
//! Talks to a Supabase-style REST endpoint:
//! - `GET  /rest/v1/subscriptions?user_id=eq.<id>` for the balance row
//! - `POST /rest/v1/rpc/deduct_credits_and_log_usage` for the atomic spend
//! - `PATCH /rest/v1/subscriptions?user_id=eq.<id>` to suspend
//!
//! The deduct procedure answers HTTP 200 with a message string either way;
//! this adapter turns a non-`Success` message into `RemoteError::Rejected`.

use async_trait::async_trait;
use once_cell::sync::Lazy;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;
use tracing::warn;

use super::remote::BalanceAuthority;
use super::types::{BalanceRecord, DeductReceipt, DeductRequest};
use crate::config::RestConfig;
use crate::error::RemoteError;

const BALANCE_COLUMNS: &str = "id,credits_left,plan_type,plan_end_date,status";
const DEDUCT_RPC: &str = "deduct_credits_and_log_usage";
const MAX_RETRIES: u32 = 2;

/// Shared HTTP client for authority calls
///
/// Short timeout: every call sits behind a user action or a background
/// refresh, never a long-running stream.
static REST_CLIENT: Lazy<Client> = Lazy::new(|| {
    Client::builder()
        .timeout(Duration::from_secs(15))
        .pool_max_idle_per_host(8)
        .pool_idle_timeout(Duration::from_secs(90))
        .tcp_keepalive(Duration::from_secs(60))
        .build()
        .expect("Failed to create REST authority HTTP client")
});

/// [`BalanceAuthority`] backed by a PostgREST endpoint
pub struct RestAuthority {
    config: RestConfig,
    client: Client,
}

impl RestAuthority {
    pub fn new(config: RestConfig) -> Self {
        Self {
            config,
            client: REST_CLIENT.clone(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/rest/v1/{}", self.config.base_url, path)
    }

    fn authorized(&self, builder: RequestBuilder) -> RequestBuilder {
        builder
            .header("apikey", &self.config.api_key)
            .header("Authorization", format!("Bearer {}", self.config.api_key))
    }

    /// Send with retry on 429. Transport errors are only retried for
    /// idempotent calls, since a lost response to a deduct may still have
    /// been applied.
    async fn send<F>(&self, build: F, idempotent: bool) -> Result<Response, RemoteError>
    where
        F: Fn() -> RequestBuilder,
    {
        let mut retry_delay = Duration::from_millis(250);

        for retry in 0..=MAX_RETRIES {
            if retry > 0 {
                tokio::time::sleep(retry_delay).await;
                retry_delay *= 2;
            }

            match self.authorized(build()).send().await {
                Ok(r) if r.status() == StatusCode::TOO_MANY_REQUESTS => {
                    warn!("Authority rate limited, retry {}/{}", retry + 1, MAX_RETRIES);
                    continue;
                }
                Ok(r) if r.status().is_success() => return Ok(r),
                Ok(r) => {
                    let status = r.status().as_u16();
                    let body = r.text().await.unwrap_or_default();
                    return Err(RemoteError::Status { status, body });
                }
                Err(e) => {
                    if !idempotent || retry == MAX_RETRIES {
                        return Err(e.into());
                    }
                    warn!(error = %e, "Authority request failed, retrying");
                }
            }
        }

        Err(RemoteError::Transport("max retries exceeded".to_string()))
    }
}

#[async_trait]
impl BalanceAuthority for RestAuthority {
    async fn fetch_balance(&self, identity_id: &str) -> Result<BalanceRecord, RemoteError> {
        let filter = format!("eq.{}", identity_id);
        let response = self
            .send(
                || {
                    self.client
                        .get(self.url("subscriptions"))
                        .query(&[("user_id", filter.as_str()), ("select", BALANCE_COLUMNS)])
                },
                true,
            )
            .await?;

        let rows: Vec<BalanceRecord> = response.json().await?;
        rows.into_iter()
            .next()
            .ok_or_else(|| RemoteError::NotFound(identity_id.to_string()))
    }

    async fn deduct_and_log(&self, request: &DeductRequest) -> Result<DeductReceipt, RemoteError> {
        let body = json!({
            "p_user_id": request.identity_id,
            "p_subscription_id": request.record_id,
            "p_amount": request.amount,
            "p_usage_type": request.usage_type,
        });
        let response = self
            .send(
                || self.client.post(self.url(&format!("rpc/{}", DEDUCT_RPC))).json(&body),
                false,
            )
            .await?;

        let text = response.text().await?;
        classify_deduct_message(parse_rpc_message(&text)?)
    }

    async fn suspend(&self, identity_id: &str) -> Result<(), RemoteError> {
        let filter = format!("eq.{}", identity_id);
        self.send(
            || {
                self.client
                    .patch(self.url("subscriptions"))
                    .query(&[("user_id", filter.as_str())])
                    .header("Prefer", "return=minimal")
                    .json(&json!({ "status": "suspended" }))
            },
            true,
        )
        .await?;
        Ok(())
    }
}

/// Extract the message from an RPC body: a JSON string, an object with a
/// `message` field, or bare text.
fn parse_rpc_message(body: &str) -> Result<String, RemoteError> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum RpcBody {
        Text(String),
        Object { message: String },
    }

    let trimmed = body.trim();
    if trimmed.is_empty() {
        return Err(RemoteError::Decode("empty RPC response".to_string()));
    }
    match serde_json::from_str::<RpcBody>(trimmed) {
        Ok(RpcBody::Text(message)) | Ok(RpcBody::Object { message }) => Ok(message),
        Err(_) if !trimmed.starts_with('{') && !trimmed.starts_with('[') => {
            Ok(trimmed.to_string())
        }
        Err(e) => Err(RemoteError::Decode(e.to_string())),
    }
}

/// Map the procedure's message onto a typed result
fn classify_deduct_message(message: String) -> Result<DeductReceipt, RemoteError> {
    if message.trim_start().to_ascii_lowercase().starts_with("success") {
        Ok(DeductReceipt { message })
    } else {
        Err(RemoteError::Rejected(message))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_json_string_body() {
        assert_eq!(
            parse_rpc_message("\"Success: 5 credits left\"").unwrap(),
            "Success: 5 credits left"
        );
    }

    #[test]
    fn test_parse_object_body() {
        assert_eq!(
            parse_rpc_message(r#"{"message":"Error: subscription not found"}"#).unwrap(),
            "Error: subscription not found"
        );
    }

    #[test]
    fn test_parse_bare_text_and_garbage() {
        assert_eq!(parse_rpc_message("Success").unwrap(), "Success");
        assert!(matches!(parse_rpc_message("   "), Err(RemoteError::Decode(_))));
        assert!(matches!(
            parse_rpc_message(r#"{"unexpected":1}"#),
            Err(RemoteError::Decode(_))
        ));
    }

    #[test]
    fn test_success_message_is_receipt() {
        let receipt = classify_deduct_message("Success: deducted 25".to_string()).unwrap();
        assert_eq!(receipt.message, "Success: deducted 25");
    }

    #[test]
    fn test_failure_message_is_rejected() {
        // HTTP 200 with a failure payload must not count as a spend
        let err = classify_deduct_message("Error: insufficient credits".to_string()).unwrap_err();
        assert_eq!(
            err,
            RemoteError::Rejected("Error: insufficient credits".to_string())
        );
    }

    #[test]
    fn test_url_building() {
        let authority = RestAuthority::new(RestConfig {
            base_url: "https://example.supabase.co".to_string(),
            api_key: "anon".to_string(),
        });
        assert_eq!(
            authority.url("rpc/deduct_credits_and_log_usage"),
            "https://example.supabase.co/rest/v1/rpc/deduct_credits_and_log_usage"
        );
    }
}
