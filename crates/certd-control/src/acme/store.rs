//! Persistence of ACME accounts, orders, authorizations and challenges.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use certd_db::entities::{
    acme_account::{self, AccountStatus},
    acme_authorization::{self, AuthorizationStatus},
    acme_challenge::{self, ChallengeStatus, ChallengeType},
    acme_order::{self, OrderStatus},
};
use chrono::{DateTime, Duration, Utc};
use sea_orm::sea_query::Expr;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, DbErr, EntityTrait, QueryFilter,
    QueryOrder, Set, TransactionTrait,
};

/// Random 128-bit token, base64url
fn token() -> String {
    URL_SAFE_NO_PAD.encode(rand::random::<[u8; 16]>())
}

/// New order parameters
#[derive(Debug, Clone)]
pub struct NewOrder {
    pub account_id: String,
    pub ca_id: String,
    /// Normalized DNS identifiers, wildcards included
    pub identifiers: Vec<String>,
    pub expires_at: DateTime<Utc>,
    pub authorization_lifetime: Duration,
}

#[derive(Clone)]
pub struct AcmeStore {
    db: DatabaseConnection,
}

impl AcmeStore {
    pub fn new(db: DatabaseConnection) -> Self {
        Self { db }
    }

    // Accounts

    pub async fn account_by_thumbprint(
        &self,
        thumbprint: &str,
    ) -> Result<Option<acme_account::Model>, DbErr> {
        acme_account::Entity::find()
            .filter(acme_account::Column::Thumbprint.eq(thumbprint))
            .one(&self.db)
            .await
    }

    pub async fn account(&self, id: &str) -> Result<Option<acme_account::Model>, DbErr> {
        acme_account::Entity::find_by_id(id.to_string())
            .one(&self.db)
            .await
    }

    pub async fn create_account(
        &self,
        ca_id: &str,
        thumbprint: &str,
        jwk: &serde_json::Value,
        contact: &[String],
        now: DateTime<Utc>,
    ) -> Result<acme_account::Model, DbErr> {
        acme_account::ActiveModel {
            id: Set(token()),
            ca_id: Set(ca_id.to_string()),
            thumbprint: Set(thumbprint.to_string()),
            jwk: Set(jwk.to_string()),
            contact: Set(serde_json::to_string(contact).unwrap_or_else(|_| "[]".to_string())),
            status: Set(AccountStatus::Valid),
            created_at: Set(now),
        }
        .insert(&self.db)
        .await
    }

    pub async fn update_account(
        &self,
        account: acme_account::Model,
        contact: Option<&[String]>,
        status: Option<AccountStatus>,
    ) -> Result<acme_account::Model, DbErr> {
        let mut active: acme_account::ActiveModel = account.into();
        if let Some(contact) = contact {
            active.contact =
                Set(serde_json::to_string(contact).unwrap_or_else(|_| "[]".to_string()));
        }
        if let Some(status) = status {
            active.status = Set(status);
        }
        active.update(&self.db).await
    }

    // Orders

    /// Create an order with one authorization per identifier. Wildcard
    /// identifiers only get a `dns-01` challenge.
    pub async fn create_order(
        &self,
        new: NewOrder,
        now: DateTime<Utc>,
    ) -> Result<acme_order::Model, DbErr> {
        let txn = self.db.begin().await?;

        let order = acme_order::ActiveModel {
            id: Set(token()),
            account_id: Set(new.account_id),
            ca_id: Set(new.ca_id),
            status: Set(OrderStatus::Pending),
            identifiers: Set(
                serde_json::to_string(&new.identifiers).unwrap_or_else(|_| "[]".to_string())
            ),
            expires_at: Set(new.expires_at),
            csr_pem: Set(None),
            certificate_id: Set(None),
            error: Set(None),
            created_at: Set(now),
        }
        .insert(&txn)
        .await?;

        let authz_expires = (now + new.authorization_lifetime).min(new.expires_at);
        for identifier in &new.identifiers {
            let (name, wildcard) = match identifier.strip_prefix("*.") {
                Some(bare) => (bare.to_string(), true),
                None => (identifier.clone(), false),
            };
            let authz = acme_authorization::ActiveModel {
                id: Set(token()),
                order_id: Set(order.id.clone()),
                identifier: Set(name),
                wildcard: Set(wildcard),
                status: Set(AuthorizationStatus::Pending),
                expires_at: Set(authz_expires),
            }
            .insert(&txn)
            .await?;

            let types: &[ChallengeType] = if wildcard {
                &[ChallengeType::Dns01]
            } else {
                &[ChallengeType::Http01, ChallengeType::Dns01]
            };
            for challenge_type in types {
                acme_challenge::ActiveModel {
                    id: Set(token()),
                    authorization_id: Set(authz.id.clone()),
                    challenge_type: Set(*challenge_type),
                    token: Set(token()),
                    status: Set(ChallengeStatus::Pending),
                    validated_at: Set(None),
                    error: Set(None),
                }
                .insert(&txn)
                .await?;
            }
        }

        txn.commit().await?;
        Ok(order)
    }

    pub async fn order(&self, id: &str) -> Result<Option<acme_order::Model>, DbErr> {
        acme_order::Entity::find_by_id(id.to_string())
            .one(&self.db)
            .await
    }

    pub async fn account_orders(&self, account_id: &str) -> Result<Vec<acme_order::Model>, DbErr> {
        acme_order::Entity::find()
            .filter(acme_order::Column::AccountId.eq(account_id))
            .order_by_asc(acme_order::Column::CreatedAt)
            .all(&self.db)
            .await
    }

    /// Compare-and-set the order status. Returns whether the row changed.
    pub async fn transition_order(
        &self,
        id: &str,
        from: &[OrderStatus],
        to: OrderStatus,
    ) -> Result<bool, DbErr> {
        let result = acme_order::Entity::update_many()
            .col_expr(acme_order::Column::Status, Expr::value(to))
            .filter(acme_order::Column::Id.eq(id))
            .filter(acme_order::Column::Status.is_in(from.iter().copied()))
            .exec(&self.db)
            .await?;
        Ok(result.rows_affected == 1)
    }

    /// `ready → processing`, recording the CSR.
    pub async fn begin_processing(&self, id: &str, csr_pem: &str) -> Result<bool, DbErr> {
        let result = acme_order::Entity::update_many()
            .col_expr(acme_order::Column::Status, Expr::value(OrderStatus::Processing))
            .col_expr(acme_order::Column::CsrPem, Expr::value(Some(csr_pem.to_string())))
            .filter(acme_order::Column::Id.eq(id))
            .filter(acme_order::Column::Status.eq(OrderStatus::Ready))
            .exec(&self.db)
            .await?;
        Ok(result.rows_affected == 1)
    }

    /// `processing → ready`, undoing [`Self::begin_processing`] when the
    /// issuance job could not be queued.
    pub async fn abandon_processing(&self, id: &str) -> Result<bool, DbErr> {
        let result = acme_order::Entity::update_many()
            .col_expr(acme_order::Column::Status, Expr::value(OrderStatus::Ready))
            .col_expr(acme_order::Column::CsrPem, Expr::value(Option::<String>::None))
            .filter(acme_order::Column::Id.eq(id))
            .filter(acme_order::Column::Status.eq(OrderStatus::Processing))
            .filter(acme_order::Column::CertificateId.is_null())
            .exec(&self.db)
            .await?;
        Ok(result.rows_affected == 1)
    }

    /// `processing → valid` with the issued certificate.
    pub async fn complete_order(&self, id: &str, certificate_id: &str) -> Result<bool, DbErr> {
        let result = acme_order::Entity::update_many()
            .col_expr(acme_order::Column::Status, Expr::value(OrderStatus::Valid))
            .col_expr(
                acme_order::Column::CertificateId,
                Expr::value(Some(certificate_id.to_string())),
            )
            .filter(acme_order::Column::Id.eq(id))
            .filter(acme_order::Column::Status.eq(OrderStatus::Processing))
            .exec(&self.db)
            .await?;
        Ok(result.rows_affected == 1)
    }

    /// Move a non-terminal order to `invalid` with a problem document.
    pub async fn invalidate_order(&self, id: &str, problem: &str) -> Result<bool, DbErr> {
        let result = acme_order::Entity::update_many()
            .col_expr(acme_order::Column::Status, Expr::value(OrderStatus::Invalid))
            .col_expr(acme_order::Column::Error, Expr::value(Some(problem.to_string())))
            .filter(acme_order::Column::Id.eq(id))
            .filter(
                acme_order::Column::Status.is_in([
                    OrderStatus::Pending,
                    OrderStatus::Ready,
                    OrderStatus::Processing,
                ]),
            )
            .exec(&self.db)
            .await?;
        Ok(result.rows_affected == 1)
    }

    // Authorizations

    pub async fn order_authorizations(
        &self,
        order_id: &str,
    ) -> Result<Vec<acme_authorization::Model>, DbErr> {
        acme_authorization::Entity::find()
            .filter(acme_authorization::Column::OrderId.eq(order_id))
            .order_by_asc(acme_authorization::Column::Identifier)
            .all(&self.db)
            .await
    }

    pub async fn authorization(
        &self,
        id: &str,
    ) -> Result<Option<acme_authorization::Model>, DbErr> {
        acme_authorization::Entity::find_by_id(id.to_string())
            .one(&self.db)
            .await
    }

    /// Compare-and-set on `pending` authorizations only.
    pub async fn settle_authorization(
        &self,
        id: &str,
        to: AuthorizationStatus,
    ) -> Result<bool, DbErr> {
        let result = acme_authorization::Entity::update_many()
            .col_expr(acme_authorization::Column::Status, Expr::value(to))
            .filter(acme_authorization::Column::Id.eq(id))
            .filter(acme_authorization::Column::Status.eq(AuthorizationStatus::Pending))
            .exec(&self.db)
            .await?;
        Ok(result.rows_affected == 1)
    }

    // Challenges

    pub async fn authorization_challenges(
        &self,
        authorization_id: &str,
    ) -> Result<Vec<acme_challenge::Model>, DbErr> {
        acme_challenge::Entity::find()
            .filter(acme_challenge::Column::AuthorizationId.eq(authorization_id))
            .order_by_asc(acme_challenge::Column::ChallengeType)
            .all(&self.db)
            .await
    }

    pub async fn challenge(&self, id: &str) -> Result<Option<acme_challenge::Model>, DbErr> {
        acme_challenge::Entity::find_by_id(id.to_string())
            .one(&self.db)
            .await
    }

    /// `pending → processing`. Returns false if validation was already requested.
    pub async fn start_validation(&self, id: &str) -> Result<bool, DbErr> {
        let result = acme_challenge::Entity::update_many()
            .col_expr(
                acme_challenge::Column::Status,
                Expr::value(ChallengeStatus::Processing),
            )
            .filter(acme_challenge::Column::Id.eq(id))
            .filter(acme_challenge::Column::Status.eq(ChallengeStatus::Pending))
            .exec(&self.db)
            .await?;
        Ok(result.rows_affected == 1)
    }

    /// `processing → pending` when the validation job could not be queued.
    pub async fn abandon_validation(&self, id: &str) -> Result<bool, DbErr> {
        let result = acme_challenge::Entity::update_many()
            .col_expr(
                acme_challenge::Column::Status,
                Expr::value(ChallengeStatus::Pending),
            )
            .filter(acme_challenge::Column::Id.eq(id))
            .filter(acme_challenge::Column::Status.eq(ChallengeStatus::Processing))
            .exec(&self.db)
            .await?;
        Ok(result.rows_affected == 1)
    }

    /// `processing → valid | invalid`.
    pub async fn finish_validation(
        &self,
        id: &str,
        outcome: Result<DateTime<Utc>, String>,
    ) -> Result<bool, DbErr> {
        let (status, validated_at, error) = match outcome {
            Ok(at) => (ChallengeStatus::Valid, Some(at), None),
            Err(problem) => (ChallengeStatus::Invalid, None, Some(problem)),
        };
        let result = acme_challenge::Entity::update_many()
            .col_expr(acme_challenge::Column::Status, Expr::value(status))
            .col_expr(acme_challenge::Column::ValidatedAt, Expr::value(validated_at))
            .col_expr(acme_challenge::Column::Error, Expr::value(error))
            .filter(acme_challenge::Column::Id.eq(id))
            .filter(acme_challenge::Column::Status.eq(ChallengeStatus::Processing))
            .exec(&self.db)
            .await?;
        Ok(result.rows_affected == 1)
    }
}
