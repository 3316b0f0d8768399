//! Initial schema: authorities, certificates, revocations and ACME objects

use sea_orm_migration::{prelude::*, schema::*};

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        // ============================================================
        // 1. Certificate authorities
        // ============================================================
        manager
            .create_table(
                Table::create()
                    .table(CertificateAuthorities::Table)
                    .if_not_exists()
                    .col(string_len(CertificateAuthorities::Id, 36).primary_key())
                    .col(string_len(CertificateAuthorities::Name, 255).unique_key())
                    .col(string_len(CertificateAuthorities::KeyRef, 255))
                    .col(text(CertificateAuthorities::CertPem))
                    .col(text(CertificateAuthorities::Subject))
                    .col(big_integer(CertificateAuthorities::NextSerial).default(1))
                    .col(string_len(CertificateAuthorities::Status, 16).default("active"))
                    .col(timestamp_with_time_zone(CertificateAuthorities::NotBefore))
                    .col(timestamp_with_time_zone(CertificateAuthorities::NotAfter))
                    .col(string_len(CertificateAuthorities::OcspKeyRef, 255))
                    .col(text(CertificateAuthorities::OcspCertPem))
                    .col(integer(CertificateAuthorities::KeyGeneration).default(1))
                    .col(boolean(CertificateAuthorities::AcmeEnabled).default(true))
                    .col(string_len_null(CertificateAuthorities::LeaseHolder, 255))
                    .col(timestamp_with_time_zone_null(
                        CertificateAuthorities::LeaseExpiresAt,
                    ))
                    .col(
                        timestamp_with_time_zone(CertificateAuthorities::CreatedAt)
                            .default(Expr::current_timestamp()),
                    )
                    .to_owned(),
            )
            .await?;

        // ============================================================
        // 2. Certificates
        // ============================================================
        manager
            .create_table(
                Table::create()
                    .table(Certificates::Table)
                    .if_not_exists()
                    .col(string_len(Certificates::Id, 36).primary_key())
                    .col(string_len(Certificates::CaId, 36))
                    .col(big_integer(Certificates::Serial))
                    .col(string_len_null(Certificates::CommonName, 255))
                    .col(text(Certificates::Sans))
                    .col(timestamp_with_time_zone(Certificates::NotBefore))
                    .col(timestamp_with_time_zone(Certificates::NotAfter))
                    .col(string_len(Certificates::Status, 16).default("valid"))
                    .col(big_integer(Certificates::StatusVersion).default(1))
                    .col(text(Certificates::CertPem))
                    .col(string_len(Certificates::IdempotencyKey, 255).unique_key())
                    .col(string_len_null(Certificates::OrderId, 36))
                    .col(
                        timestamp_with_time_zone(Certificates::CreatedAt)
                            .default(Expr::current_timestamp()),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_certificates_ca")
                            .from(Certificates::Table, Certificates::CaId)
                            .to(CertificateAuthorities::Table, CertificateAuthorities::Id)
                            .on_delete(ForeignKeyAction::Restrict),
                    )
                    .to_owned(),
            )
            .await?;

        // Serial uniqueness per CA is the backstop for allocation races
        manager
            .create_index(
                Index::create()
                    .if_not_exists()
                    .name("idx_certificates_ca_serial")
                    .table(Certificates::Table)
                    .col(Certificates::CaId)
                    .col(Certificates::Serial)
                    .unique()
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .if_not_exists()
                    .name("idx_certificates_status_not_after")
                    .table(Certificates::Table)
                    .col(Certificates::Status)
                    .col(Certificates::NotAfter)
                    .to_owned(),
            )
            .await?;

        // ============================================================
        // 3. Revocations
        // ============================================================
        manager
            .create_table(
                Table::create()
                    .table(Revocations::Table)
                    .if_not_exists()
                    .col(string_len(Revocations::CertificateId, 36).primary_key())
                    .col(string_len(Revocations::CaId, 36))
                    .col(big_integer(Revocations::Serial))
                    .col(string_len(Revocations::Reason, 32))
                    .col(timestamp_with_time_zone(Revocations::RevokedAt))
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_revocations_certificate")
                            .from(Revocations::Table, Revocations::CertificateId)
                            .to(Certificates::Table, Certificates::Id)
                            .on_delete(ForeignKeyAction::Restrict),
                    )
                    .to_owned(),
            )
            .await?;

        // ============================================================
        // 4. ACME accounts
        // ============================================================
        manager
            .create_table(
                Table::create()
                    .table(AcmeAccounts::Table)
                    .if_not_exists()
                    .col(string_len(AcmeAccounts::Id, 36).primary_key())
                    .col(string_len(AcmeAccounts::CaId, 36))
                    .col(string_len(AcmeAccounts::Thumbprint, 64).unique_key())
                    .col(text(AcmeAccounts::Jwk))
                    .col(text(AcmeAccounts::Contact))
                    .col(string_len(AcmeAccounts::Status, 16).default("valid"))
                    .col(
                        timestamp_with_time_zone(AcmeAccounts::CreatedAt)
                            .default(Expr::current_timestamp()),
                    )
                    .to_owned(),
            )
            .await?;

        // ============================================================
        // 5. ACME orders
        // ============================================================
        manager
            .create_table(
                Table::create()
                    .table(AcmeOrders::Table)
                    .if_not_exists()
                    .col(string_len(AcmeOrders::Id, 36).primary_key())
                    .col(string_len(AcmeOrders::AccountId, 36))
                    .col(string_len(AcmeOrders::CaId, 36))
                    .col(string_len(AcmeOrders::Status, 16).default("pending"))
                    .col(text(AcmeOrders::Identifiers))
                    .col(timestamp_with_time_zone(AcmeOrders::ExpiresAt))
                    .col(text_null(AcmeOrders::CsrPem))
                    .col(string_len_null(AcmeOrders::CertificateId, 36))
                    .col(text_null(AcmeOrders::Error))
                    .col(
                        timestamp_with_time_zone(AcmeOrders::CreatedAt)
                            .default(Expr::current_timestamp()),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_acme_orders_account")
                            .from(AcmeOrders::Table, AcmeOrders::AccountId)
                            .to(AcmeAccounts::Table, AcmeAccounts::Id)
                            .on_delete(ForeignKeyAction::Cascade),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .if_not_exists()
                    .name("idx_acme_orders_account")
                    .table(AcmeOrders::Table)
                    .col(AcmeOrders::AccountId)
                    .to_owned(),
            )
            .await?;

        // ============================================================
        // 6. ACME authorizations
        // ============================================================
        manager
            .create_table(
                Table::create()
                    .table(AcmeAuthorizations::Table)
                    .if_not_exists()
                    .col(string_len(AcmeAuthorizations::Id, 36).primary_key())
                    .col(string_len(AcmeAuthorizations::OrderId, 36))
                    .col(string_len(AcmeAuthorizations::Identifier, 255))
                    .col(boolean(AcmeAuthorizations::Wildcard).default(false))
                    .col(string_len(AcmeAuthorizations::Status, 16).default("pending"))
                    .col(timestamp_with_time_zone(AcmeAuthorizations::ExpiresAt))
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_acme_authorizations_order")
                            .from(AcmeAuthorizations::Table, AcmeAuthorizations::OrderId)
                            .to(AcmeOrders::Table, AcmeOrders::Id)
                            .on_delete(ForeignKeyAction::Cascade),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .if_not_exists()
                    .name("idx_acme_authorizations_order")
                    .table(AcmeAuthorizations::Table)
                    .col(AcmeAuthorizations::OrderId)
                    .to_owned(),
            )
            .await?;

        // ============================================================
        // 7. ACME challenges
        // ============================================================
        manager
            .create_table(
                Table::create()
                    .table(AcmeChallenges::Table)
                    .if_not_exists()
                    .col(string_len(AcmeChallenges::Id, 36).primary_key())
                    .col(string_len(AcmeChallenges::AuthorizationId, 36))
                    .col(string_len(AcmeChallenges::ChallengeType, 16))
                    .col(string_len(AcmeChallenges::Token, 64))
                    .col(string_len(AcmeChallenges::Status, 16).default("pending"))
                    .col(timestamp_with_time_zone_null(AcmeChallenges::ValidatedAt))
                    .col(text_null(AcmeChallenges::Error))
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_acme_challenges_authorization")
                            .from(AcmeChallenges::Table, AcmeChallenges::AuthorizationId)
                            .to(AcmeAuthorizations::Table, AcmeAuthorizations::Id)
                            .on_delete(ForeignKeyAction::Cascade),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .if_not_exists()
                    .name("idx_acme_challenges_authorization")
                    .table(AcmeChallenges::Table)
                    .col(AcmeChallenges::AuthorizationId)
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(AcmeChallenges::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(AcmeAuthorizations::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(AcmeOrders::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(AcmeAccounts::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(Revocations::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(Certificates::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(CertificateAuthorities::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum CertificateAuthorities {
    #[sea_orm(iden = "certificate_authorities")]
    Table,
    Id,
    Name,
    KeyRef,
    CertPem,
    Subject,
    NextSerial,
    Status,
    NotBefore,
    NotAfter,
    OcspKeyRef,
    OcspCertPem,
    KeyGeneration,
    AcmeEnabled,
    LeaseHolder,
    LeaseExpiresAt,
    CreatedAt,
}

#[derive(DeriveIden)]
enum Certificates {
    Table,
    Id,
    CaId,
    Serial,
    CommonName,
    Sans,
    NotBefore,
    NotAfter,
    Status,
    StatusVersion,
    CertPem,
    IdempotencyKey,
    OrderId,
    CreatedAt,
}

#[derive(DeriveIden)]
enum Revocations {
    Table,
    CertificateId,
    CaId,
    Serial,
    Reason,
    RevokedAt,
}

#[derive(DeriveIden)]
enum AcmeAccounts {
    Table,
    Id,
    CaId,
    Thumbprint,
    Jwk,
    Contact,
    Status,
    CreatedAt,
}

#[derive(DeriveIden)]
enum AcmeOrders {
    Table,
    Id,
    AccountId,
    CaId,
    Status,
    Identifiers,
    ExpiresAt,
    CsrPem,
    CertificateId,
    Error,
    CreatedAt,
}

#[derive(DeriveIden)]
enum AcmeAuthorizations {
    Table,
    Id,
    OrderId,
    Identifier,
    Wildcard,
    Status,
    ExpiresAt,
}

#[derive(DeriveIden)]
enum AcmeChallenges {
    Table,
    Id,
    AuthorizationId,
    ChallengeType,
    Token,
    Status,
    ValidatedAt,
    Error,
}
