//! CertificateAuthority entity: a signing root or intermediate

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// Whether the authority may sign
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, EnumIter, DeriveActiveEnum)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::N(16))")]
pub enum CaStatus {
    #[sea_orm(string_value = "active")]
    Active,

    #[sea_orm(string_value = "disabled")]
    Disabled,
}

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "certificate_authorities")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: String,

    /// Human readable name, unique across the deployment
    #[sea_orm(unique)]
    pub name: String,

    /// Key Store reference of the CA signing key
    pub key_ref: String,

    /// CA certificate in PEM format
    #[sea_orm(column_type = "Text")]
    pub cert_pem: String,

    /// Subject distinguished name (RFC 4514 rendering)
    pub subject: String,

    /// Next serial number to hand out. Only ever increases.
    pub next_serial: i64,

    pub status: CaStatus,

    pub not_before: ChronoDateTimeUtc,
    pub not_after: ChronoDateTimeUtc,

    /// Key Store reference of the delegated OCSP responder key
    pub ocsp_key_ref: String,

    /// Delegated OCSP responder certificate in PEM format
    #[sea_orm(column_type = "Text")]
    pub ocsp_cert_pem: String,

    /// Bumped whenever the CA or OCSP key rotates
    pub key_generation: i32,

    /// Whether ACME clients may use this authority
    pub acme_enabled: bool,

    /// Worker instance currently holding the signing lease
    pub lease_holder: Option<String>,
    pub lease_expires_at: Option<ChronoDateTimeUtc>,

    pub created_at: ChronoDateTimeUtc,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(has_many = "super::certificate::Entity")]
    Certificates,
}

impl Related<super::certificate::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Certificates.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
