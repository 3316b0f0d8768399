//! Write-of-record access to authorities, certificates and revocations.
//!
//! Every mutation runs in one transaction so a failure never leaves an
//! allocated serial without its certificate.

use certd_cert::IssuedCertificate;
use certd_db::entities::{
    certificate::{self, CertificateStatus},
    certificate_authority::{self, CaStatus},
    crl,
    revocation::{self, RevocationReason},
};
use chrono::{DateTime, Duration, Utc};
use sea_orm::sea_query::{Condition, Expr};
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, DatabaseConnection, DatabaseTransaction,
    EntityTrait, JoinType, PaginatorTrait, QueryFilter, QueryOrder, QuerySelect, RelationTrait,
    Set, SqlErr, TransactionTrait,
};
use tracing::{debug, info, warn};

use crate::error::IssuanceError;

/// Attempts at the compare-and-set on `next_serial` before giving up
const SERIAL_CAS_ATTEMPTS: usize = 16;

/// Filter for certificate listings
#[derive(Debug, Clone, Default)]
pub struct CertificateFilter {
    pub ca_id: Option<String>,
    pub status: Option<CertificateStatus>,
    pub limit: u64,
    pub offset: u64,
}

/// Status snapshot of one serial, as OCSP needs it
#[derive(Debug, Clone)]
pub struct SerialRecord {
    pub certificate: certificate::Model,
    pub revocation: Option<revocation::Model>,
}

#[derive(Clone)]
pub struct CaStore {
    db: DatabaseConnection,
}

impl CaStore {
    pub fn new(db: DatabaseConnection) -> Self {
        Self { db }
    }

    pub fn connection(&self) -> &DatabaseConnection {
        &self.db
    }

    pub async fn ping(&self) -> Result<(), IssuanceError> {
        certd_db::ping(&self.db).await?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Authorities
    // ------------------------------------------------------------------

    pub async fn insert_ca(
        &self,
        ca: certificate_authority::ActiveModel,
    ) -> Result<certificate_authority::Model, IssuanceError> {
        Ok(ca.insert(&self.db).await?)
    }

    pub async fn get_ca(&self, id: &str) -> Result<certificate_authority::Model, IssuanceError> {
        certificate_authority::Entity::find_by_id(id.to_string())
            .one(&self.db)
            .await?
            .ok_or_else(|| IssuanceError::NotFound(format!("{}: CA not found.", id)))
    }

    /// Look up a CA by id or by name.
    pub async fn find_ca(
        &self,
        id_or_name: &str,
    ) -> Result<Option<certificate_authority::Model>, IssuanceError> {
        Ok(certificate_authority::Entity::find()
            .filter(
                Condition::any()
                    .add(certificate_authority::Column::Id.eq(id_or_name))
                    .add(certificate_authority::Column::Name.eq(id_or_name)),
            )
            .one(&self.db)
            .await?)
    }

    pub async fn list_cas(&self) -> Result<Vec<certificate_authority::Model>, IssuanceError> {
        Ok(certificate_authority::Entity::find()
            .order_by_asc(certificate_authority::Column::CreatedAt)
            .all(&self.db)
            .await?)
    }

    /// Active CAs inside their validity window.
    pub async fn usable_cas(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<certificate_authority::Model>, IssuanceError> {
        Ok(certificate_authority::Entity::find()
            .filter(certificate_authority::Column::Status.eq(CaStatus::Active))
            .filter(certificate_authority::Column::NotBefore.lte(now))
            .filter(certificate_authority::Column::NotAfter.gt(now))
            .order_by_asc(certificate_authority::Column::CreatedAt)
            .all(&self.db)
            .await?)
    }

    pub async fn set_ca_status(&self, id: &str, status: CaStatus) -> Result<(), IssuanceError> {
        let result = certificate_authority::Entity::update_many()
            .col_expr(certificate_authority::Column::Status, Expr::value(status))
            .filter(certificate_authority::Column::Id.eq(id))
            .exec(&self.db)
            .await?;
        if result.rows_affected == 0 {
            return Err(IssuanceError::NotFound(format!("{}: CA not found.", id)));
        }
        Ok(())
    }

    /// Replace the delegated OCSP responder and bump the key generation,
    /// which makes every cached response of the old generation unusable.
    pub async fn rotate_ocsp_responder(
        &self,
        id: &str,
        ocsp_key_ref: &str,
        ocsp_cert_pem: &str,
    ) -> Result<i32, IssuanceError> {
        let txn = self.db.begin().await?;
        let ca = certificate_authority::Entity::find_by_id(id.to_string())
            .one(&txn)
            .await?
            .ok_or_else(|| IssuanceError::NotFound(format!("{}: CA not found.", id)))?;
        let generation = ca.key_generation + 1;

        let mut active: certificate_authority::ActiveModel = ca.into();
        active.ocsp_key_ref = Set(ocsp_key_ref.to_string());
        active.ocsp_cert_pem = Set(ocsp_cert_pem.to_string());
        active.key_generation = Set(generation);
        active.update(&txn).await?;
        txn.commit().await?;

        info!(ca_id = %id, generation, "OCSP responder rotated");
        Ok(generation)
    }

    // ------------------------------------------------------------------
    // Cross-process signing lease
    // ------------------------------------------------------------------

    /// Take (or extend) the signing lease on a CA for `holder`.
    ///
    /// Succeeds when the lease is free, expired, or already held by `holder`.
    pub async fn acquire_ca_lease(
        &self,
        ca_id: &str,
        holder: &str,
        ttl: std::time::Duration,
    ) -> Result<bool, IssuanceError> {
        let now = Utc::now();
        let expires = now
            + Duration::from_std(ttl)
                .map_err(|e| IssuanceError::Internal(format!("lease ttl: {}", e)))?;

        let result = certificate_authority::Entity::update_many()
            .col_expr(
                certificate_authority::Column::LeaseHolder,
                Expr::value(Some(holder.to_string())),
            )
            .col_expr(
                certificate_authority::Column::LeaseExpiresAt,
                Expr::value(Some(expires)),
            )
            .filter(certificate_authority::Column::Id.eq(ca_id))
            .filter(
                Condition::any()
                    .add(certificate_authority::Column::LeaseHolder.is_null())
                    .add(certificate_authority::Column::LeaseHolder.eq(holder))
                    .add(certificate_authority::Column::LeaseExpiresAt.lt(now)),
            )
            .exec(&self.db)
            .await?;

        Ok(result.rows_affected == 1)
    }

    pub async fn release_ca_lease(&self, ca_id: &str, holder: &str) -> Result<(), IssuanceError> {
        certificate_authority::Entity::update_many()
            .col_expr(
                certificate_authority::Column::LeaseHolder,
                Expr::value(Option::<String>::None),
            )
            .col_expr(
                certificate_authority::Column::LeaseExpiresAt,
                Expr::value(Option::<DateTime<Utc>>::None),
            )
            .filter(certificate_authority::Column::Id.eq(ca_id))
            .filter(certificate_authority::Column::LeaseHolder.eq(holder))
            .exec(&self.db)
            .await?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Serials and certificates
    // ------------------------------------------------------------------

    /// Allocate the next serial of a CA inside `txn`.
    async fn allocate_serial(
        txn: &DatabaseTransaction,
        ca_id: &str,
    ) -> Result<i64, IssuanceError> {
        for _ in 0..SERIAL_CAS_ATTEMPTS {
            let ca = certificate_authority::Entity::find_by_id(ca_id.to_string())
                .one(txn)
                .await?
                .ok_or_else(|| IssuanceError::NotFound(format!("{}: CA not found.", ca_id)))?;
            let serial = ca.next_serial;

            let result = certificate_authority::Entity::update_many()
                .col_expr(
                    certificate_authority::Column::NextSerial,
                    Expr::value(serial + 1),
                )
                .filter(certificate_authority::Column::Id.eq(ca_id))
                .filter(certificate_authority::Column::NextSerial.eq(serial))
                .exec(txn)
                .await?;

            if result.rows_affected == 1 {
                return Ok(serial);
            }
            debug!(ca_id, serial, "Serial compare-and-set lost, retrying");
        }
        Err(IssuanceError::TransientDependency(format!(
            "could not allocate a serial for {} after {} attempts",
            ca_id, SERIAL_CAS_ATTEMPTS
        )))
    }

    /// Allocate a serial that is not tied to a certificate row, e.g. for a
    /// delegated responder certificate.
    pub async fn reserve_serial(&self, ca_id: &str) -> Result<i64, IssuanceError> {
        let txn = self.db.begin().await?;
        let serial = Self::allocate_serial(&txn, ca_id).await?;
        txn.commit().await?;
        Ok(serial)
    }

    /// Allocate a serial, build and sign the certificate, and persist it,
    /// all in one transaction.
    ///
    /// If a certificate with `idempotency_key` already exists it is returned
    /// unchanged and `build` is never called.
    pub async fn issue<F>(
        &self,
        ca_id: &str,
        idempotency_key: &str,
        order_id: Option<&str>,
        build: F,
    ) -> Result<(certificate::Model, bool), IssuanceError>
    where
        F: FnOnce(i64) -> Result<IssuedCertificate, IssuanceError> + Send,
    {
        let txn = self.db.begin().await?;

        if let Some(existing) = certificate::Entity::find()
            .filter(certificate::Column::IdempotencyKey.eq(idempotency_key))
            .one(&txn)
            .await?
        {
            txn.commit().await?;
            return Ok((existing, false));
        }

        let serial = Self::allocate_serial(&txn, ca_id).await?;
        let issued = build(serial)?;
        if issued.serial != serial {
            return Err(IssuanceError::DataConsistency(format!(
                "built certificate carries serial {} instead of {}",
                issued.serial, serial
            )));
        }

        let sans = issued_sans(&issued);
        let model = certificate::ActiveModel {
            id: Set(uuid::Uuid::new_v4().to_string()),
            ca_id: Set(ca_id.to_string()),
            serial: Set(serial),
            common_name: Set(common_name(&issued.subject)),
            sans: Set(serde_json::to_string(&sans).unwrap_or_else(|_| "[]".to_string())),
            not_before: Set(issued.not_before),
            not_after: Set(issued.not_after),
            status: Set(CertificateStatus::Valid),
            status_version: Set(1),
            cert_pem: Set(issued.pem.clone()),
            idempotency_key: Set(idempotency_key.to_string()),
            order_id: Set(order_id.map(str::to_string)),
            created_at: Set(Utc::now()),
        }
        .insert(&txn)
        .await?;

        txn.commit().await?;
        info!(ca_id, serial, "Certificate persisted");
        Ok((model, true))
    }

    pub async fn find_by_idempotency_key(
        &self,
        key: &str,
    ) -> Result<Option<certificate::Model>, IssuanceError> {
        Ok(certificate::Entity::find()
            .filter(certificate::Column::IdempotencyKey.eq(key))
            .one(&self.db)
            .await?)
    }

    pub async fn get_certificate(
        &self,
        ca_id: &str,
        serial: i64,
    ) -> Result<Option<certificate::Model>, IssuanceError> {
        Ok(certificate::Entity::find()
            .filter(certificate::Column::CaId.eq(ca_id))
            .filter(certificate::Column::Serial.eq(serial))
            .one(&self.db)
            .await?)
    }

    pub async fn get_certificate_by_id(
        &self,
        id: &str,
    ) -> Result<Option<certificate::Model>, IssuanceError> {
        Ok(certificate::Entity::find_by_id(id.to_string())
            .one(&self.db)
            .await?)
    }

    pub async fn list_certificates(
        &self,
        filter: &CertificateFilter,
    ) -> Result<(Vec<certificate::Model>, u64), IssuanceError> {
        let mut query = certificate::Entity::find();
        if let Some(ca_id) = &filter.ca_id {
            query = query.filter(certificate::Column::CaId.eq(ca_id.as_str()));
        }
        if let Some(status) = filter.status {
            query = query.filter(certificate::Column::Status.eq(status));
        }
        let total = query.clone().count(&self.db).await?;
        let limit = if filter.limit == 0 { 50 } else { filter.limit.min(500) };
        let rows = query
            .order_by_desc(certificate::Column::CreatedAt)
            .offset(filter.offset)
            .limit(limit)
            .all(&self.db)
            .await?;
        Ok((rows, total))
    }

    pub async fn serial_record(
        &self,
        ca_id: &str,
        serial: i64,
    ) -> Result<Option<SerialRecord>, IssuanceError> {
        let Some(certificate) = self.get_certificate(ca_id, serial).await? else {
            return Ok(None);
        };
        let revocation = revocation::Entity::find_by_id(certificate.id.clone())
            .one(&self.db)
            .await?;
        if certificate.status == CertificateStatus::Revoked && revocation.is_none() {
            return Err(IssuanceError::DataConsistency(format!(
                "certificate {} is revoked without a revocation record",
                certificate.id
            )));
        }
        Ok(Some(SerialRecord {
            certificate,
            revocation,
        }))
    }

    // ------------------------------------------------------------------
    // Revocation and expiry
    // ------------------------------------------------------------------

    /// Record a revocation and mark the certificate revoked.
    pub async fn revoke(
        &self,
        ca_id: &str,
        serial: i64,
        reason: RevocationReason,
        now: DateTime<Utc>,
    ) -> Result<SerialRecord, IssuanceError> {
        let txn = self.db.begin().await?;

        let cert = certificate::Entity::find()
            .filter(certificate::Column::CaId.eq(ca_id))
            .filter(certificate::Column::Serial.eq(serial))
            .one(&txn)
            .await?
            .ok_or_else(|| {
                IssuanceError::NotFound(format!(
                    "{}: Certificate not found.",
                    certd_cert::format_serial(serial)
                ))
            })?;

        match cert.status {
            CertificateStatus::Valid => {}
            CertificateStatus::Revoked => {
                return Err(IssuanceError::AlreadyRevoked(certd_cert::format_serial(
                    serial,
                )))
            }
            CertificateStatus::Expired => {
                return Err(IssuanceError::InvalidTransition(format!(
                    "{}: Certificate has expired.",
                    certd_cert::format_serial(serial)
                )))
            }
        }

        let record = revocation::ActiveModel {
            certificate_id: Set(cert.id.clone()),
            ca_id: Set(ca_id.to_string()),
            serial: Set(serial),
            reason: Set(reason),
            revoked_at: Set(now),
        }
        .insert(&txn)
        .await?;

        let result = certificate::Entity::update_many()
            .col_expr(
                certificate::Column::Status,
                Expr::value(CertificateStatus::Revoked),
            )
            .col_expr(
                certificate::Column::StatusVersion,
                Expr::col(certificate::Column::StatusVersion).add(1),
            )
            .filter(certificate::Column::Id.eq(cert.id.as_str()))
            .filter(certificate::Column::Status.eq(CertificateStatus::Valid))
            .exec(&txn)
            .await?;
        if result.rows_affected != 1 {
            // Changed status since it was read; the transaction rolls back on drop
            return Err(IssuanceError::InvalidTransition(format!(
                "{}: Certificate is no longer valid.",
                certd_cert::format_serial(serial)
            )));
        }

        let certificate = certificate::Entity::find_by_id(cert.id.clone())
            .one(&txn)
            .await?
            .ok_or_else(|| IssuanceError::DataConsistency("revoked row vanished".to_string()))?;
        txn.commit().await?;

        info!(ca_id, serial, reason = ?reason, "Certificate revoked");
        Ok(SerialRecord {
            certificate,
            revocation: Some(record),
        })
    }

    /// Move valid certificates past notAfter to expired.
    pub async fn expire_due(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<certificate::Model>, IssuanceError> {
        let due = certificate::Entity::find()
            .filter(certificate::Column::Status.eq(CertificateStatus::Valid))
            .filter(certificate::Column::NotAfter.lte(now))
            .all(&self.db)
            .await?;

        let mut expired = Vec::with_capacity(due.len());
        for cert in due {
            let result = certificate::Entity::update_many()
                .col_expr(
                    certificate::Column::Status,
                    Expr::value(CertificateStatus::Expired),
                )
                .col_expr(
                    certificate::Column::StatusVersion,
                    Expr::col(certificate::Column::StatusVersion).add(1),
                )
                .filter(certificate::Column::Id.eq(cert.id.as_str()))
                .filter(certificate::Column::Status.eq(CertificateStatus::Valid))
                .exec(&self.db)
                .await?;
            if result.rows_affected == 1 {
                if let Some(updated) = self.get_certificate_by_id(&cert.id).await? {
                    expired.push(updated);
                }
            } else {
                warn!(id = %cert.id, "Certificate changed status during expiry sweep");
            }
        }
        Ok(expired)
    }

    /// Certificates whose OCSP responses are maintained: every non-expired
    /// certificate, revoked ones included.
    pub async fn live_certificates(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<certificate::Model>, IssuanceError> {
        Ok(certificate::Entity::find()
            .filter(certificate::Column::Status.ne(CertificateStatus::Expired))
            .filter(certificate::Column::NotAfter.gt(now))
            .all(&self.db)
            .await?)
    }

    // ------------------------------------------------------------------
    // Revocation lists
    // ------------------------------------------------------------------

    /// Revocations a CRL lists at `now`: certificates past notAfter drop off.
    pub async fn crl_revocations(
        &self,
        ca_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Vec<revocation::Model>, IssuanceError> {
        Ok(revocation::Entity::find()
            .join(JoinType::InnerJoin, revocation::Relation::Certificate.def())
            .filter(revocation::Column::CaId.eq(ca_id))
            .filter(certificate::Column::Status.eq(CertificateStatus::Revoked))
            .filter(certificate::Column::NotAfter.gt(now))
            .order_by_asc(revocation::Column::Serial)
            .all(&self.db)
            .await?)
    }

    pub async fn get_crl(
        &self,
        ca_id: &str,
        scope: &str,
    ) -> Result<Option<crl::Model>, IssuanceError> {
        Ok(crl::Entity::find_by_id(crl::Model::key(ca_id, scope))
            .one(&self.db)
            .await?)
    }

    /// Store a signed list built on top of `previous` (the number it
    /// replaces). Returns false when another publication got there first.
    pub async fn publish_crl(
        &self,
        list: crl::Model,
        previous: Option<i64>,
    ) -> Result<bool, IssuanceError> {
        let Some(previous) = previous else {
            let active = crl::ActiveModel {
                id: Set(list.id),
                ca_id: Set(list.ca_id),
                scope: Set(list.scope),
                number: Set(list.number),
                der: Set(list.der),
                entries: Set(list.entries),
                this_update: Set(list.this_update),
                next_update: Set(list.next_update),
            };
            return match active.insert(&self.db).await {
                Ok(_) => Ok(true),
                Err(err)
                    if matches!(err.sql_err(), Some(SqlErr::UniqueConstraintViolation(_))) =>
                {
                    Ok(false)
                }
                Err(err) => Err(err.into()),
            };
        };

        let result = crl::Entity::update_many()
            .col_expr(crl::Column::Number, Expr::value(list.number))
            .col_expr(crl::Column::Der, Expr::value(list.der))
            .col_expr(crl::Column::Entries, Expr::value(list.entries))
            .col_expr(crl::Column::ThisUpdate, Expr::value(list.this_update))
            .col_expr(crl::Column::NextUpdate, Expr::value(list.next_update))
            .filter(crl::Column::Id.eq(list.id.as_str()))
            .filter(crl::Column::Number.eq(previous))
            .exec(&self.db)
            .await?;
        Ok(result.rows_affected == 1)
    }
}

fn common_name(subject: &str) -> Option<String> {
    subject
        .split(',')
        .map(str::trim)
        .find_map(|part| part.strip_prefix("CN="))
        .map(str::to_string)
}

fn issued_sans(issued: &IssuedCertificate) -> Vec<String> {
    use x509_parser::extensions::GeneralName;
    use x509_parser::prelude::{FromDer, X509Certificate};

    let Ok((_, cert)) = X509Certificate::from_der(&issued.der) else {
        return Vec::new();
    };
    let Ok(Some(san)) = cert.subject_alternative_name() else {
        return Vec::new();
    };
    san.value
        .general_names
        .iter()
        .filter_map(|name| match name {
            GeneralName::DNSName(dns) => Some(dns.to_string()),
            GeneralName::IPAddress(bytes) => match bytes.len() {
                4 => {
                    let octets: [u8; 4] = (*bytes).try_into().ok()?;
                    Some(std::net::IpAddr::from(octets).to_string())
                }
                16 => {
                    let octets: [u8; 16] = (*bytes).try_into().ok()?;
                    Some(std::net::IpAddr::from(octets).to_string())
                }
                _ => None,
            },
            _ => None,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn store_with_certificate(not_after: DateTime<Utc>) -> CaStore {
        let db = certd_db::connect("sqlite::memory:").await.unwrap();
        certd_db::migrate(&db).await.unwrap();
        let store = CaStore::new(db);
        let now = Utc::now();

        store
            .insert_ca(certificate_authority::ActiveModel {
                id: Set("ca-1".to_string()),
                name: Set("root".to_string()),
                key_ref: Set("root-key".to_string()),
                cert_pem: Set(String::new()),
                subject: Set("CN=Root".to_string()),
                next_serial: Set(2),
                status: Set(CaStatus::Active),
                not_before: Set(now - Duration::days(30)),
                not_after: Set(now + Duration::days(3650)),
                ocsp_key_ref: Set("root-ocsp".to_string()),
                ocsp_cert_pem: Set(String::new()),
                key_generation: Set(1),
                acme_enabled: Set(false),
                lease_holder: Set(None),
                lease_expires_at: Set(None),
                created_at: Set(now),
            })
            .await
            .unwrap();

        certificate::ActiveModel {
            id: Set("cert-1".to_string()),
            ca_id: Set("ca-1".to_string()),
            serial: Set(1),
            common_name: Set(Some("old.example.com".to_string())),
            sans: Set("[\"old.example.com\"]".to_string()),
            not_before: Set(now - Duration::days(10)),
            not_after: Set(not_after),
            status: Set(CertificateStatus::Valid),
            status_version: Set(1),
            cert_pem: Set(String::new()),
            idempotency_key: Set("req-1".to_string()),
            order_id: Set(None),
            created_at: Set(now - Duration::days(10)),
        }
        .insert(store.connection())
        .await
        .unwrap();
        store
    }

    #[tokio::test]
    async fn test_expired_certificate_cannot_be_revoked() {
        let now = Utc::now();
        let store = store_with_certificate(now - Duration::hours(1)).await;

        let expired = store.expire_due(now).await.unwrap();
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].status, CertificateStatus::Expired);

        let err = store
            .revoke("ca-1", 1, RevocationReason::KeyCompromise, now)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::InvalidTransition);
        assert!(!err.is_retryable());

        let record = store.serial_record("ca-1", 1).await.unwrap().unwrap();
        assert_eq!(record.certificate.status, CertificateStatus::Expired);
        assert!(record.revocation.is_none());
    }

    #[tokio::test]
    async fn test_valid_certificate_is_revoked_once() {
        let now = Utc::now();
        let store = store_with_certificate(now + Duration::days(30)).await;

        let record = store
            .revoke("ca-1", 1, RevocationReason::Superseded, now)
            .await
            .unwrap();
        assert_eq!(record.certificate.status, CertificateStatus::Revoked);
        assert_eq!(record.certificate.status_version, 2);

        let err = store
            .revoke("ca-1", 1, RevocationReason::KeyCompromise, now)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::AlreadyRevoked);

        // Revoked certificates are never swept to expired
        assert!(store.expire_due(now + Duration::days(60)).await.unwrap().is_empty());
    }

    fn crl_row(number: i64, now: DateTime<Utc>) -> crl::Model {
        crl::Model {
            id: crl::Model::key("ca-1", "full"),
            ca_id: "ca-1".to_string(),
            scope: "full".to_string(),
            number,
            der: vec![0x30, 0x00],
            entries: 0,
            this_update: now,
            next_update: now + Duration::days(1),
        }
    }

    #[tokio::test]
    async fn test_crl_publication_is_compare_and_swap() {
        let now = Utc::now();
        let store = store_with_certificate(now + Duration::days(30)).await;

        assert!(store.publish_crl(crl_row(1, now), None).await.unwrap());
        // A second first publication loses
        assert!(!store.publish_crl(crl_row(1, now), None).await.unwrap());

        assert!(store.publish_crl(crl_row(2, now), Some(1)).await.unwrap());
        // Built on a number that was already replaced
        assert!(!store.publish_crl(crl_row(2, now), Some(1)).await.unwrap());

        let stored = store.get_crl("ca-1", "full").await.unwrap().unwrap();
        assert_eq!(stored.number, 2);
        assert!(store.get_crl("ca-1", "user").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_crl_lists_only_unexpired_revocations() {
        let now = Utc::now();
        let store = store_with_certificate(now + Duration::days(30)).await;
        assert!(store.crl_revocations("ca-1", now).await.unwrap().is_empty());

        store
            .revoke("ca-1", 1, RevocationReason::CessationOfOperation, now)
            .await
            .unwrap();
        let listed = store.crl_revocations("ca-1", now).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].serial, 1);

        let later = now + Duration::days(31);
        assert!(store.crl_revocations("ca-1", later).await.unwrap().is_empty());
    }

    #[test]
    fn test_common_name_from_subject() {
        assert_eq!(
            common_name("CN=example.com, O=certd"),
            Some("example.com".to_string())
        );
        assert_eq!(common_name("O=certd"), None);
    }
}
