//! Database migrations

use sea_orm_migration::prelude::*;

mod m20260301_000001_init_schema;
mod m20260305_000001_create_job_queue;
mod m20260312_000001_add_job_lease_owner;
mod m20260314_000001_create_crls;

pub struct Migrator;

#[async_trait::async_trait]
impl MigratorTrait for Migrator {
    fn migrations() -> Vec<Box<dyn MigrationTrait>> {
        vec![
            Box::new(m20260301_000001_init_schema::Migration),
            Box::new(m20260305_000001_create_job_queue::Migration),
            Box::new(m20260312_000001_add_job_lease_owner::Migration),
            Box::new(m20260314_000001_create_crls::Migration),
        ]
    }
}
