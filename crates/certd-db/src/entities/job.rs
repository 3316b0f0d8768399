//! Job entity backing the at-least-once work queue

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, EnumIter, DeriveActiveEnum)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::N(16))")]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    /// Waiting for a worker (possibly after a retry backoff)
    #[sea_orm(string_value = "queued")]
    Queued,
    /// Claimed by a worker until `leased_until`
    #[sea_orm(string_value = "running")]
    Running,
    #[sea_orm(string_value = "succeeded")]
    Succeeded,
    /// Non-retryable failure
    #[sea_orm(string_value = "failed")]
    Failed,
    /// Retry budget exhausted; see `dead_letters`
    #[sea_orm(string_value = "dead")]
    Dead,
    /// Cancelled by a newer version for the same subject
    #[sea_orm(string_value = "superseded")]
    Superseded,
}

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "jobs")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: String,

    /// Job variant name, used as the handler registry key
    pub kind: String,

    /// Serialized job payload (JSON)
    #[sea_orm(column_type = "Text")]
    pub payload: String,

    #[sea_orm(unique)]
    pub idempotency_key: String,

    /// Subject used for supersession, e.g. `<ca_id>:<serial>`
    pub subject: Option<String>,

    /// Version stamp of the subject this job was created for
    pub version: i64,

    pub status: JobStatus,
    pub attempts: i32,

    pub available_at: ChronoDateTimeUtc,
    pub leased_until: Option<ChronoDateTimeUtc>,

    /// Worker holding the current lease
    pub lease_owner: Option<String>,

    #[sea_orm(column_type = "Text", nullable)]
    pub last_error: Option<String>,

    /// Error classification of the last failure
    pub error_kind: Option<String>,

    /// Handler result as JSON
    #[sea_orm(column_type = "Text", nullable)]
    pub result: Option<String>,

    pub created_at: ChronoDateTimeUtc,
    pub updated_at: ChronoDateTimeUtc,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
