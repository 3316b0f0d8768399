//! Job queue and dead letter tables

use sea_orm_migration::{prelude::*, schema::*};

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(Jobs::Table)
                    .if_not_exists()
                    .col(string_len(Jobs::Id, 36).primary_key())
                    .col(string_len(Jobs::Kind, 32))
                    .col(text(Jobs::Payload))
                    .col(string_len(Jobs::IdempotencyKey, 255).unique_key())
                    .col(string_len_null(Jobs::Subject, 255))
                    .col(big_integer(Jobs::Version).default(0))
                    .col(string_len(Jobs::Status, 16).default("queued"))
                    .col(integer(Jobs::Attempts).default(0))
                    .col(timestamp_with_time_zone(Jobs::AvailableAt))
                    .col(timestamp_with_time_zone_null(Jobs::LeasedUntil))
                    .col(text_null(Jobs::LastError))
                    .col(string_len_null(Jobs::ErrorKind, 32))
                    .col(text_null(Jobs::JobResult))
                    .col(
                        timestamp_with_time_zone(Jobs::CreatedAt)
                            .default(Expr::current_timestamp()),
                    )
                    .col(
                        timestamp_with_time_zone(Jobs::UpdatedAt)
                            .default(Expr::current_timestamp()),
                    )
                    .to_owned(),
            )
            .await?;

        // Claim scans filter on status and availability
        manager
            .create_index(
                Index::create()
                    .if_not_exists()
                    .name("idx_jobs_status_available")
                    .table(Jobs::Table)
                    .col(Jobs::Status)
                    .col(Jobs::AvailableAt)
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .if_not_exists()
                    .name("idx_jobs_subject")
                    .table(Jobs::Table)
                    .col(Jobs::Subject)
                    .to_owned(),
            )
            .await?;

        manager
            .create_table(
                Table::create()
                    .table(DeadLetters::Table)
                    .if_not_exists()
                    .col(string_len(DeadLetters::Id, 36).primary_key())
                    .col(string_len(DeadLetters::JobId, 36))
                    .col(string_len(DeadLetters::Kind, 32))
                    .col(text(DeadLetters::Payload))
                    .col(text(DeadLetters::Error))
                    .col(integer(DeadLetters::Attempts))
                    .col(timestamp_with_time_zone(DeadLetters::FailedAt))
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(DeadLetters::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(Jobs::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum Jobs {
    Table,
    Id,
    Kind,
    Payload,
    IdempotencyKey,
    Subject,
    Version,
    Status,
    Attempts,
    AvailableAt,
    LeasedUntil,
    LastError,
    ErrorKind,
    #[sea_orm(iden = "result")]
    JobResult,
    CreatedAt,
    UpdatedAt,
}

#[derive(DeriveIden)]
enum DeadLetters {
    Table,
    Id,
    JobId,
    Kind,
    Payload,
    Error,
    Attempts,
    FailedAt,
}
