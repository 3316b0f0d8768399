//! Integration tests for certd-db
//!
//! Runs the schema against a real SQLite in-memory database

use certd_db::{
    connect,
    entities::{
        certificate::{self, CertificateStatus},
        certificate_authority::{self, CaStatus},
        job::{self, JobStatus},
        revocation::{self, RevocationReason},
    },
    migrate, ping,
};
use chrono::{Duration, Utc};
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, EntityTrait, PaginatorTrait, QueryFilter, Set,
};

async fn setup_test_db() -> sea_orm::DatabaseConnection {
    let db = connect("sqlite::memory:")
        .await
        .expect("Failed to connect to in-memory database");

    migrate(&db).await.expect("Failed to run migrations");

    db
}

async fn insert_ca(db: &sea_orm::DatabaseConnection, id: &str) -> certificate_authority::Model {
    let now = Utc::now();
    certificate_authority::ActiveModel {
        id: Set(id.to_string()),
        name: Set(format!("ca-{}", id)),
        key_ref: Set(format!("{}-key", id)),
        cert_pem: Set("-----BEGIN CERTIFICATE-----".to_string()),
        subject: Set("CN=Test CA".to_string()),
        next_serial: Set(1),
        status: Set(CaStatus::Active),
        not_before: Set(now),
        not_after: Set(now + Duration::days(365)),
        ocsp_key_ref: Set(format!("{}-ocsp", id)),
        ocsp_cert_pem: Set(String::new()),
        key_generation: Set(1),
        acme_enabled: Set(true),
        lease_holder: Set(None),
        lease_expires_at: Set(None),
        created_at: Set(now),
    }
    .insert(db)
    .await
    .expect("insert ca")
}

fn cert_model(id: &str, ca_id: &str, serial: i64, key: &str) -> certificate::ActiveModel {
    let now = Utc::now();
    certificate::ActiveModel {
        id: Set(id.to_string()),
        ca_id: Set(ca_id.to_string()),
        serial: Set(serial),
        common_name: Set(Some("example.com".to_string())),
        sans: Set(r#"["example.com"]"#.to_string()),
        not_before: Set(now),
        not_after: Set(now + Duration::days(90)),
        status: Set(CertificateStatus::Valid),
        status_version: Set(1),
        cert_pem: Set(String::new()),
        idempotency_key: Set(key.to_string()),
        order_id: Set(None),
        created_at: Set(now),
    }
}

#[tokio::test]
async fn test_database_connection() {
    let db = connect("sqlite::memory:").await.expect("Failed to connect");

    let backend = db.get_database_backend();
    assert!(matches!(backend, sea_orm::DatabaseBackend::Sqlite));
    assert!(ping(&db).await.is_ok());
}

#[tokio::test]
async fn test_migrations_run_successfully() {
    let db = connect("sqlite::memory:").await.expect("Failed to connect");

    assert!(migrate(&db).await.is_ok());
    // Idempotent on a migrated database
    assert!(migrate(&db).await.is_ok());
}

#[tokio::test]
async fn test_serial_unique_per_ca() {
    let db = setup_test_db().await;
    insert_ca(&db, "ca-a").await;
    insert_ca(&db, "ca-b").await;

    cert_model("c1", "ca-a", 42, "k1").insert(&db).await.unwrap();

    let dup = cert_model("c2", "ca-a", 42, "k2").insert(&db).await;
    assert!(dup.is_err(), "duplicate serial within a CA must be rejected");

    // Same serial under another CA is fine
    cert_model("c3", "ca-b", 42, "k3").insert(&db).await.unwrap();

    let count = certificate::Entity::find()
        .filter(certificate::Column::Serial.eq(42))
        .count(&db)
        .await
        .unwrap();
    assert_eq!(count, 2);
}

#[tokio::test]
async fn test_idempotency_key_unique() {
    let db = setup_test_db().await;
    insert_ca(&db, "ca-a").await;

    cert_model("c1", "ca-a", 1, "same").insert(&db).await.unwrap();
    let dup = cert_model("c2", "ca-a", 2, "same").insert(&db).await;
    assert!(dup.is_err());
}

#[tokio::test]
async fn test_one_revocation_per_certificate() {
    let db = setup_test_db().await;
    insert_ca(&db, "ca-a").await;
    cert_model("c1", "ca-a", 7, "k1").insert(&db).await.unwrap();

    let record = || revocation::ActiveModel {
        certificate_id: Set("c1".to_string()),
        ca_id: Set("ca-a".to_string()),
        serial: Set(7),
        reason: Set(RevocationReason::KeyCompromise),
        revoked_at: Set(Utc::now()),
    };

    record().insert(&db).await.unwrap();
    assert!(record().insert(&db).await.is_err());

    let stored = revocation::Entity::find_by_id("c1".to_string())
        .one(&db)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored.reason, RevocationReason::KeyCompromise);
}

#[tokio::test]
async fn test_job_roundtrip() {
    let db = setup_test_db().await;
    let now = Utc::now();

    job::ActiveModel {
        id: Set("job-1".to_string()),
        kind: Set("issue".to_string()),
        payload: Set("{}".to_string()),
        idempotency_key: Set("issue:abc".to_string()),
        subject: Set(None),
        version: Set(0),
        status: Set(JobStatus::Queued),
        attempts: Set(0),
        available_at: Set(now),
        leased_until: Set(None),
        lease_owner: Set(None),
        last_error: Set(None),
        error_kind: Set(None),
        result: Set(None),
        created_at: Set(now),
        updated_at: Set(now),
    }
    .insert(&db)
    .await
    .unwrap();

    let queued = job::Entity::find()
        .filter(job::Column::Status.eq(JobStatus::Queued))
        .all(&db)
        .await
        .unwrap();
    assert_eq!(queued.len(), 1);
    assert_eq!(queued[0].kind, "issue");
}

#[test]
fn test_revocation_reason_codes() {
    assert_eq!(RevocationReason::KeyCompromise.code(), 1);
    assert_eq!(RevocationReason::RemoveFromCrl.code(), 8);
    assert_eq!(RevocationReason::from_code(7), None);
    assert_eq!(
        RevocationReason::from_code(10),
        Some(RevocationReason::AaCompromise)
    );
    assert_eq!(
        RevocationReason::parse("key_compromise"),
        Some(RevocationReason::KeyCompromise)
    );
    assert_eq!(
        RevocationReason::parse("keyCompromise"),
        Some(RevocationReason::KeyCompromise)
    );
    assert_eq!(RevocationReason::parse("bogus"), None);
}
