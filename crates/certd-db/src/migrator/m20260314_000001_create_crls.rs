//! Signed revocation lists published by the worker

use sea_orm_migration::{prelude::*, schema::*};

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(Crls::Table)
                    .if_not_exists()
                    .col(string_len(Crls::Id, 48).primary_key())
                    .col(string_len(Crls::CaId, 36))
                    .col(string_len(Crls::Scope, 8))
                    .col(big_integer(Crls::Number))
                    .col(blob(Crls::Der))
                    .col(integer(Crls::Entries).default(0))
                    .col(timestamp_with_time_zone(Crls::ThisUpdate))
                    .col(timestamp_with_time_zone(Crls::NextUpdate))
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_crls_ca")
                            .from(Crls::Table, Crls::CaId)
                            .to(CertificateAuthorities::Table, CertificateAuthorities::Id)
                            .on_delete(ForeignKeyAction::Cascade),
                    )
                    .to_owned(),
            )
            .await
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(Crls::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum Crls {
    Table,
    Id,
    CaId,
    Scope,
    Number,
    Der,
    Entries,
    ThisUpdate,
    NextUpdate,
}

#[derive(DeriveIden)]
enum CertificateAuthorities {
    Table,
    Id,
}
