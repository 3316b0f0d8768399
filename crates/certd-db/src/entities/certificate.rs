//! Certificate entity: an issued end-entity certificate

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// Lifecycle status. Moves only from `Valid` to `Revoked` or `Expired`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, EnumIter, DeriveActiveEnum)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::N(16))")]
pub enum CertificateStatus {
    #[sea_orm(string_value = "valid")]
    Valid,

    #[sea_orm(string_value = "revoked")]
    Revoked,

    #[sea_orm(string_value = "expired")]
    Expired,
}

impl CertificateStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CertificateStatus::Valid => "valid",
            CertificateStatus::Revoked => "revoked",
            CertificateStatus::Expired => "expired",
        }
    }
}

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "certificates")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: String,

    pub ca_id: String,

    /// Serial number, unique within `ca_id`
    pub serial: i64,

    pub common_name: Option<String>,

    /// Subject alternative names as a JSON array of strings
    #[sea_orm(column_type = "Text")]
    pub sans: String,

    pub not_before: ChronoDateTimeUtc,
    pub not_after: ChronoDateTimeUtc,

    pub status: CertificateStatus,

    /// Monotonic version stamp, bumped on every status change
    pub status_version: i64,

    #[sea_orm(column_type = "Text")]
    pub cert_pem: String,

    /// Key of the issuance job that produced this row
    #[sea_orm(unique)]
    pub idempotency_key: String,

    /// ACME order this certificate finalizes, if any
    pub order_id: Option<String>,

    pub created_at: ChronoDateTimeUtc,
}

impl Model {
    pub fn san_list(&self) -> Vec<String> {
        serde_json::from_str(&self.sans).unwrap_or_default()
    }
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::certificate_authority::Entity",
        from = "Column::CaId",
        to = "super::certificate_authority::Column::Id"
    )]
    CertificateAuthority,
    #[sea_orm(has_one = "super::revocation::Entity")]
    Revocation,
}

impl Related<super::certificate_authority::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::CertificateAuthority.def()
    }
}

impl Related<super::revocation::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Revocation.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
