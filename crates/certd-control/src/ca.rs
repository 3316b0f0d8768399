//! Authority bootstrap and responder key rotation.

use std::sync::Arc;

use certd_cert::{create_root_ca, issue_ocsp_responder, KeyStore, RootCaParams};
use certd_db::entities::certificate_authority::{self, CaStatus};
use chrono::{DateTime, Duration, Utc};
use sea_orm::Set;
use tracing::info;

use crate::config::OcspConfig;
use crate::error::IssuanceError;
use crate::store::CaStore;

/// Parameters of a new root CA
#[derive(Debug, Clone)]
pub struct InitCa {
    /// Unique name, also used in ACME directory URLs
    pub name: String,
    pub common_name: String,
    pub organization: Option<String>,
    pub validity_days: i64,
    pub acme_enabled: bool,
}

/// Create a root CA with its key, certificate and delegated OCSP responder.
///
/// The CA stays disabled until its responder certificate exists.
pub async fn init_ca(
    store: &CaStore,
    keys: &Arc<dyn KeyStore>,
    ocsp: &OcspConfig,
    params: InitCa,
    now: DateTime<Utc>,
) -> Result<certificate_authority::Model, IssuanceError> {
    if !valid_ca_name(&params.name) {
        return Err(IssuanceError::Internal(format!(
            "{}: CA names may only contain lowercase letters, digits, '-' and '_'",
            params.name
        )));
    }
    if store.find_ca(&params.name).await?.is_some() {
        return Err(IssuanceError::Internal(format!(
            "{}: a CA with this name already exists",
            params.name
        )));
    }

    let id = uuid::Uuid::new_v4().to_string();
    let key_ref = format!("ca-{}", id);
    keys.generate(&key_ref).await?;

    let root = {
        let lease = keys.acquire(&key_ref).await?;
        create_root_ca(
            &lease,
            &RootCaParams {
                common_name: params.common_name.clone(),
                organization: params.organization.clone(),
                validity_days: params.validity_days,
            },
            now,
        )?
    };

    store
        .insert_ca(certificate_authority::ActiveModel {
            id: Set(id.clone()),
            name: Set(params.name.clone()),
            key_ref: Set(key_ref),
            cert_pem: Set(root.pem),
            subject: Set(root.subject),
            next_serial: Set(1),
            status: Set(CaStatus::Disabled),
            not_before: Set(root.not_before),
            not_after: Set(root.not_after),
            ocsp_key_ref: Set(String::new()),
            ocsp_cert_pem: Set(String::new()),
            key_generation: Set(0),
            acme_enabled: Set(params.acme_enabled),
            lease_holder: Set(None),
            lease_expires_at: Set(None),
            created_at: Set(now),
        })
        .await?;

    rotate_ocsp_key(store, keys, ocsp, &id, now).await?;
    store.set_ca_status(&id, CaStatus::Active).await?;

    info!(ca_id = %id, name = %params.name, "Certificate authority created");
    store.get_ca(&id).await
}

/// CA names appear in ACME URLs
fn valid_ca_name(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= 64
        && name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || matches!(c, '-' | '_'))
}

/// Issue a fresh delegated responder under a new key and bump the CA's key
/// generation. Returns the new generation.
pub async fn rotate_ocsp_key(
    store: &CaStore,
    keys: &Arc<dyn KeyStore>,
    ocsp: &OcspConfig,
    ca_id: &str,
    now: DateTime<Utc>,
) -> Result<i32, IssuanceError> {
    let ca = store.get_ca(ca_id).await?;
    let generation = ca.key_generation + 1;
    let responder_ref = format!("ocsp-{}-g{}", ca.id, generation);
    if !keys.contains(&responder_ref).await {
        keys.generate(&responder_ref).await?;
    }

    let serial = store.reserve_serial(&ca.id).await?;
    let not_after = (now + Duration::days(ocsp.responder_validity_days)).min(ca.not_after);

    let responder = {
        let ca_key = keys.acquire(&ca.key_ref).await?;
        let responder_key = keys.acquire(&responder_ref).await?;
        issue_ocsp_responder(
            &ca_key,
            &ca.cert_pem,
            &responder_key,
            &format!("{} OCSP Responder", ca.name),
            serial,
            now,
            not_after,
        )?
    };

    store
        .rotate_ocsp_responder(&ca.id, &responder_ref, &responder.pem)
        .await
}
