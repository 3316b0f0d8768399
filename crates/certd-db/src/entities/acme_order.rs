//! ACME order entity

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// Order states. `Valid` and `Invalid` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, EnumIter, DeriveActiveEnum)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::N(16))")]
#[serde(rename_all = "lowercase")]
pub enum OrderStatus {
    #[sea_orm(string_value = "pending")]
    Pending,
    #[sea_orm(string_value = "ready")]
    Ready,
    #[sea_orm(string_value = "processing")]
    Processing,
    #[sea_orm(string_value = "valid")]
    Valid,
    #[sea_orm(string_value = "invalid")]
    Invalid,
}

impl OrderStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, OrderStatus::Valid | OrderStatus::Invalid)
    }
}

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "acme_orders")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: String,

    pub account_id: String,
    pub ca_id: String,

    pub status: OrderStatus,

    /// DNS identifiers as a JSON array of strings
    #[sea_orm(column_type = "Text")]
    pub identifiers: String,

    pub expires_at: ChronoDateTimeUtc,

    /// CSR submitted at finalize time, PEM encoded
    #[sea_orm(column_type = "Text", nullable)]
    pub csr_pem: Option<String>,

    pub certificate_id: Option<String>,

    /// Problem detail recorded when the order became invalid
    #[sea_orm(column_type = "Text", nullable)]
    pub error: Option<String>,

    pub created_at: ChronoDateTimeUtc,
}

impl Model {
    pub fn identifier_list(&self) -> Vec<String> {
        serde_json::from_str(&self.identifiers).unwrap_or_default()
    }
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::acme_account::Entity",
        from = "Column::AccountId",
        to = "super::acme_account::Column::Id"
    )]
    Account,
    #[sea_orm(has_many = "super::acme_authorization::Entity")]
    Authorizations,
}

impl Related<super::acme_account::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Account.def()
    }
}

impl Related<super::acme_authorization::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Authorizations.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
