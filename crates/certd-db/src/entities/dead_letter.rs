//! Dead letter entity: jobs that exhausted their retry budget

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "dead_letters")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: String,

    pub job_id: String,
    pub kind: String,

    #[sea_orm(column_type = "Text")]
    pub payload: String,

    #[sea_orm(column_type = "Text")]
    pub error: String,

    pub attempts: i32,
    pub failed_at: ChronoDateTimeUtc,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
