//! RevocationRecord entity. One immutable row per revoked certificate.

use sea_orm::entity::prelude::*;
use sea_orm::Iterable;
use serde::{Deserialize, Serialize};

/// RFC 5280 CRLReason
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, EnumIter, DeriveActiveEnum)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::N(32))")]
#[serde(rename_all = "snake_case")]
pub enum RevocationReason {
    #[sea_orm(string_value = "unspecified")]
    Unspecified,
    #[sea_orm(string_value = "key_compromise")]
    KeyCompromise,
    #[sea_orm(string_value = "ca_compromise")]
    CaCompromise,
    #[sea_orm(string_value = "affiliation_changed")]
    AffiliationChanged,
    #[sea_orm(string_value = "superseded")]
    Superseded,
    #[sea_orm(string_value = "cessation_of_operation")]
    CessationOfOperation,
    #[sea_orm(string_value = "certificate_hold")]
    CertificateHold,
    #[sea_orm(string_value = "remove_from_crl")]
    RemoveFromCrl,
    #[sea_orm(string_value = "privilege_withdrawn")]
    PrivilegeWithdrawn,
    #[sea_orm(string_value = "aa_compromise")]
    AaCompromise,
}

impl RevocationReason {
    /// Numeric CRLReason code (value 7 is unassigned).
    pub fn code(&self) -> u8 {
        match self {
            RevocationReason::Unspecified => 0,
            RevocationReason::KeyCompromise => 1,
            RevocationReason::CaCompromise => 2,
            RevocationReason::AffiliationChanged => 3,
            RevocationReason::Superseded => 4,
            RevocationReason::CessationOfOperation => 5,
            RevocationReason::CertificateHold => 6,
            RevocationReason::RemoveFromCrl => 8,
            RevocationReason::PrivilegeWithdrawn => 9,
            RevocationReason::AaCompromise => 10,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        Some(match code {
            0 => RevocationReason::Unspecified,
            1 => RevocationReason::KeyCompromise,
            2 => RevocationReason::CaCompromise,
            3 => RevocationReason::AffiliationChanged,
            4 => RevocationReason::Superseded,
            5 => RevocationReason::CessationOfOperation,
            6 => RevocationReason::CertificateHold,
            8 => RevocationReason::RemoveFromCrl,
            9 => RevocationReason::PrivilegeWithdrawn,
            10 => RevocationReason::AaCompromise,
            _ => return None,
        })
    }

    /// Parse the snake_case name, also accepting the camelCase form.
    pub fn parse(name: &str) -> Option<Self> {
        let normalized: String = name
            .chars()
            .flat_map(|c| {
                if c.is_ascii_uppercase() {
                    vec!['_', c.to_ascii_lowercase()]
                } else {
                    vec![c]
                }
            })
            .collect();
        Self::iter().find(|r| r.to_value() == normalized)
    }
}

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "revocations")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub certificate_id: String,

    pub ca_id: String,
    pub serial: i64,
    pub reason: RevocationReason,
    pub revoked_at: ChronoDateTimeUtc,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::certificate::Entity",
        from = "Column::CertificateId",
        to = "super::certificate::Column::Id"
    )]
    Certificate,
}

impl Related<super::certificate::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Certificate.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
