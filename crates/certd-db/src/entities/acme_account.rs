//! ACME account entity: a client identity bound to one account key

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, EnumIter, DeriveActiveEnum)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::N(16))")]
#[serde(rename_all = "lowercase")]
pub enum AccountStatus {
    #[sea_orm(string_value = "valid")]
    Valid,
    #[sea_orm(string_value = "deactivated")]
    Deactivated,
    #[sea_orm(string_value = "revoked")]
    Revoked,
}

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "acme_accounts")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: String,

    pub ca_id: String,

    /// RFC 7638 thumbprint of the account key
    #[sea_orm(unique)]
    pub thumbprint: String,

    /// Account public key as a JWK JSON document
    #[sea_orm(column_type = "Text")]
    pub jwk: String,

    /// Contact URIs as a JSON array
    #[sea_orm(column_type = "Text")]
    pub contact: String,

    pub status: AccountStatus,

    pub created_at: ChronoDateTimeUtc,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(has_many = "super::acme_order::Entity")]
    Orders,
}

impl Related<super::acme_order::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Orders.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
