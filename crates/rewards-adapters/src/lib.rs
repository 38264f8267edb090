//! Partner integration adapters for voucher fulfilment.

#![deny(unsafe_code)]

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rewards_core::error::{RewardsError, RewardsResult};
use rewards_core::partner::{IssueRequest, PartnerAdapter, PartnerIssue};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Mock partner that accepts every request with a deterministic reference.
#[derive(Debug, Clone)]
pub struct MockPartnerAdapter {
    partner_id: String,
}

impl MockPartnerAdapter {
    pub fn new(partner_id: impl Into<String>) -> Self {
        Self {
            partner_id: partner_id.into(),
        }
    }
}

impl Default for MockPartnerAdapter {
    fn default() -> Self {
        Self::new("mock")
    }
}

#[async_trait]
impl PartnerAdapter for MockPartnerAdapter {
    fn partner_id(&self) -> &str {
        &self.partner_id
    }

    async fn issue(&self, request: &IssueRequest) -> RewardsResult<PartnerIssue> {
        let short_id: String = request.redemption_id.chars().take(8).collect();
        Ok(PartnerIssue {
            success: true,
            partner_reference: Some(format!("{}-{short_id}", self.partner_id)),
        })
    }
}

/// Deterministic failing partner useful for chaos testing.
#[derive(Debug, Clone)]
pub struct AlwaysFailPartner {
    partner_id: String,
    reason: String,
}

impl AlwaysFailPartner {
    pub fn new(partner_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            partner_id: partner_id.into(),
            reason: reason.into(),
        }
    }
}

#[async_trait]
impl PartnerAdapter for AlwaysFailPartner {
    fn partner_id(&self) -> &str {
        &self.partner_id
    }

    async fn issue(&self, _request: &IssueRequest) -> RewardsResult<PartnerIssue> {
        Err(RewardsError::Internal(format!(
            "partner '{}' failed: {}",
            self.partner_id, self.reason
        )))
    }
}

/// Wire body posted to an HTTP fulfilment endpoint.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IssueCall {
    pub redemption_id: String,
    pub redemption_code: String,
    pub account_id: String,
    pub voucher_id: String,
    pub voucher_title: String,
    pub partner_id: String,
    pub points_cost: u64,
    pub requested_at: DateTime<Utc>,
}

impl IssueCall {
    pub fn from_request(request: &IssueRequest, requested_at: DateTime<Utc>) -> Self {
        Self {
            redemption_id: request.redemption_id.clone(),
            redemption_code: request.redemption_code.clone(),
            account_id: request.account_id.clone(),
            voucher_id: request.voucher.voucher_id.clone(),
            voucher_title: request.voucher.title.clone(),
            partner_id: request.voucher.partner_id.clone(),
            points_cost: request.voucher.points_cost,
            requested_at,
        }
    }
}

#[derive(Debug, Deserialize)]
struct IssueReply {
    #[serde(default = "default_success")]
    success: bool,
    #[serde(default)]
    reference: Option<String>,
}

fn default_success() -> bool {
    true
}

/// Partner reached over HTTP with a JSON POST per redemption.
///
/// 2xx replies are parsed as `{"success": bool, "reference": string?}`; 4xx replies
/// count as a decline and 5xx or transport failures as retryable errors.
#[derive(Debug, Clone)]
pub struct HttpPartnerAdapter {
    partner_id: String,
    endpoint: String,
    client: reqwest::Client,
}

impl HttpPartnerAdapter {
    pub fn new(
        partner_id: impl Into<String>,
        endpoint: impl Into<String>,
        timeout: Duration,
    ) -> RewardsResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| RewardsError::Internal(format!("http client setup failed: {e}")))?;
        Ok(Self {
            partner_id: partner_id.into(),
            endpoint: endpoint.into(),
            client,
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait]
impl PartnerAdapter for HttpPartnerAdapter {
    fn partner_id(&self) -> &str {
        &self.partner_id
    }

    async fn issue(&self, request: &IssueRequest) -> RewardsResult<PartnerIssue> {
        let body = IssueCall::from_request(request, Utc::now());
        let response = self
            .client
            .post(&self.endpoint)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                RewardsError::Internal(format!("partner '{}' unreachable: {e}", self.partner_id))
            })?;

        let status = response.status();
        if status.is_client_error() {
            tracing::warn!(
                partner_id = %self.partner_id,
                redemption_id = %request.redemption_id,
                status = status.as_u16(),
                "partner rejected issuance request"
            );
            return Ok(PartnerIssue {
                success: false,
                partner_reference: None,
            });
        }
        if !status.is_success() {
            return Err(RewardsError::Internal(format!(
                "partner '{}' answered {status}",
                self.partner_id
            )));
        }

        let reply: IssueReply = response.json().await.map_err(|e| {
            RewardsError::Internal(format!(
                "partner '{}' sent an unreadable reply: {e}",
                self.partner_id
            ))
        })?;
        Ok(PartnerIssue {
            success: reply.success,
            partner_reference: reply.reference,
        })
    }
}
