//! Order, authorization and challenge transitions.
//!
//! Every transition is a compare-and-set on the current state, so replays
//! of the same validation result or issuance outcome are no-ops.

use certd_db::entities::{
    acme_authorization::AuthorizationStatus,
    acme_challenge::ChallengeStatus,
    acme_order::{self, OrderStatus},
};
use chrono::{DateTime, Utc};
use tracing::{debug, info};

use super::error::{AcmeError, Problem};
use super::store::AcmeStore;
use crate::error::IssuanceError;
use crate::validator::{ChallengeRequest, ChallengeValidator, ValidationError};

/// Serialized problem document stored with invalid orders and challenges
pub fn problem_json(problem_type: &str, detail: &str, status: u16) -> String {
    serde_json::to_string(&Problem {
        problem_type: problem_type.to_string(),
        detail: detail.to_string(),
        status,
    })
    .unwrap_or_default()
}

#[derive(Clone)]
pub struct OrderMachine {
    acme: AcmeStore,
}

impl OrderMachine {
    pub fn new(acme: AcmeStore) -> Self {
        Self { acme }
    }

    pub fn store(&self) -> &AcmeStore {
        &self.acme
    }

    /// Bring an order up to date with its authorizations and deadlines.
    pub async fn reconcile_order(
        &self,
        order: acme_order::Model,
        now: DateTime<Utc>,
    ) -> Result<acme_order::Model, IssuanceError> {
        if !matches!(order.status, OrderStatus::Pending | OrderStatus::Ready) {
            return Ok(order);
        }

        if order.expires_at <= now {
            let problem = problem_json(
                AcmeError::Malformed(String::new()).problem_type(),
                "Order expired.",
                400,
            );
            self.acme.invalidate_order(&order.id, &problem).await?;
            return self.reload(&order.id).await;
        }

        let mut authorizations = self.acme.order_authorizations(&order.id).await?;
        for authz in authorizations.iter_mut() {
            if authz.status == AuthorizationStatus::Pending && authz.expires_at <= now {
                self.acme
                    .settle_authorization(&authz.id, AuthorizationStatus::Expired)
                    .await?;
                authz.status = AuthorizationStatus::Expired;
            }
        }

        if let Some(failed) = authorizations.iter().find(|a| {
            matches!(
                a.status,
                AuthorizationStatus::Invalid | AuthorizationStatus::Expired
            )
        }) {
            let problem = problem_json(
                "urn:ietf:params:acme:error:unauthorized",
                &format!(
                    "Authorization for {} is {}.",
                    failed.identifier,
                    status_name(failed.status)
                ),
                403,
            );
            if self.acme.invalidate_order(&order.id, &problem).await? {
                info!(order_id = %order.id, "Order invalidated by authorization failure");
            }
            return self.reload(&order.id).await;
        }

        if order.status == OrderStatus::Pending
            && !authorizations.is_empty()
            && authorizations
                .iter()
                .all(|a| a.status == AuthorizationStatus::Valid)
            && self
                .acme
                .transition_order(&order.id, &[OrderStatus::Pending], OrderStatus::Ready)
                .await?
        {
            debug!(order_id = %order.id, "Order ready");
            return self.reload(&order.id).await;
        }
        Ok(order)
    }

    async fn reload(&self, id: &str) -> Result<acme_order::Model, IssuanceError> {
        self.acme
            .order(id)
            .await?
            .ok_or_else(|| IssuanceError::NotFound(format!("order {}", id)))
    }

    /// Run the external check for a challenge in `processing` and apply the result.
    pub async fn validate_challenge(
        &self,
        challenge_id: &str,
        validator: &dyn ChallengeValidator,
        now: DateTime<Utc>,
    ) -> Result<(), IssuanceError> {
        let challenge = self
            .acme
            .challenge(challenge_id)
            .await?
            .ok_or_else(|| IssuanceError::NotFound(format!("challenge {}", challenge_id)))?;
        if challenge.status != ChallengeStatus::Processing {
            debug!(challenge_id, status = ?challenge.status, "Challenge already settled");
            return Ok(());
        }

        let authz = self
            .acme
            .authorization(&challenge.authorization_id)
            .await?
            .ok_or_else(|| IssuanceError::DataConsistency("challenge without authorization".into()))?;
        let order = self.reload(&authz.order_id).await?;
        let account = self
            .acme
            .account(&order.account_id)
            .await?
            .ok_or_else(|| IssuanceError::DataConsistency("order without account".into()))?;

        let result = if authz.expires_at <= now {
            Err(ValidationError::Mismatch("Authorization expired.".to_string()))
        } else {
            let request = ChallengeRequest {
                challenge_type: challenge.challenge_type,
                identifier: authz.identifier.clone(),
                token: challenge.token.clone(),
                key_authorization: format!("{}.{}", challenge.token, account.thumbprint),
            };
            validator.validate(&request).await
        };

        self.apply_validation_result(challenge_id, result, now).await
    }

    /// Challenge result → authorization → order.
    pub async fn apply_validation_result(
        &self,
        challenge_id: &str,
        result: Result<(), ValidationError>,
        now: DateTime<Utc>,
    ) -> Result<(), IssuanceError> {
        let challenge = self
            .acme
            .challenge(challenge_id)
            .await?
            .ok_or_else(|| IssuanceError::NotFound(format!("challenge {}", challenge_id)))?;

        let authz_status = match &result {
            Ok(()) => AuthorizationStatus::Valid,
            Err(_) => AuthorizationStatus::Invalid,
        };
        let outcome = match &result {
            Ok(()) => Ok(now),
            Err(e) => Err(problem_json(e.problem_type(), &e.to_string(), 400)),
        };
        if self.acme.finish_validation(challenge_id, outcome).await? {
            info!(
                challenge_id,
                valid = result.is_ok(),
                "Challenge validation finished"
            );
        }

        self.acme
            .settle_authorization(&challenge.authorization_id, authz_status)
            .await?;

        if let Some(authz) = self.acme.authorization(&challenge.authorization_id).await? {
            let order = self.reload(&authz.order_id).await?;
            self.reconcile_order(order, now).await?;
        }
        Ok(())
    }

    /// Issuance succeeded: `processing → valid`.
    pub async fn order_issued(
        &self,
        order_id: &str,
        certificate_id: &str,
    ) -> Result<(), IssuanceError> {
        if self.acme.complete_order(order_id, certificate_id).await? {
            info!(order_id, certificate_id, "Order valid");
        }
        Ok(())
    }

    /// Issuance was rejected by policy: order becomes `invalid`.
    pub async fn order_rejected(&self, order_id: &str, detail: &str) -> Result<(), IssuanceError> {
        let problem = problem_json("urn:ietf:params:acme:error:badCSR", detail, 400);
        if self.acme.invalidate_order(order_id, &problem).await? {
            info!(order_id, detail, "Order invalid");
        }
        Ok(())
    }

    /// Whether every authorization of the order is valid.
    pub async fn all_authorizations_valid(&self, order_id: &str) -> Result<bool, IssuanceError> {
        let authorizations = self.acme.order_authorizations(order_id).await?;
        Ok(!authorizations.is_empty()
            && authorizations
                .iter()
                .all(|a| a.status == AuthorizationStatus::Valid))
    }
}

pub fn status_name(status: AuthorizationStatus) -> &'static str {
    match status {
        AuthorizationStatus::Pending => "pending",
        AuthorizationStatus::Valid => "valid",
        AuthorizationStatus::Invalid => "invalid",
        AuthorizationStatus::Expired => "expired",
    }
}
