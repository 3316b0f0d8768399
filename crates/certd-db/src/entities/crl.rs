//! Published certificate revocation lists, one row per CA and scope

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "crls")]
pub struct Model {
    /// `<ca_id>:<scope>`
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: String,

    pub ca_id: String,

    /// `full`, `ca` or `user`
    pub scope: String,

    /// CRL number; increases with every publication for the same id
    pub number: i64,

    /// Signed `CertificateList`
    #[sea_orm(column_type = "Blob")]
    #[serde(skip)]
    pub der: Vec<u8>,

    /// Revoked serials listed
    pub entries: i32,

    pub this_update: ChronoDateTimeUtc,
    pub next_update: ChronoDateTimeUtc,
}

impl Model {
    pub fn key(ca_id: &str, scope: &str) -> String {
        format!("{}:{}", ca_id, scope)
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
}

impl Related<super::certificate_authority::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::CertificateAuthority.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
