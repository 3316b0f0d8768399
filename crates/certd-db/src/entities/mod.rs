//! Database entities

pub mod acme_account;
pub mod acme_authorization;
pub mod acme_challenge;
pub mod acme_order;
pub mod certificate;
pub mod certificate_authority;
pub mod crl;
pub mod dead_letter;
pub mod job;
pub mod revocation;

pub use acme_account::Entity as AcmeAccount;
pub use acme_authorization::Entity as AcmeAuthorization;
pub use acme_challenge::Entity as AcmeChallenge;
pub use acme_order::Entity as AcmeOrder;
pub use certificate::Entity as Certificate;
pub use certificate_authority::Entity as CertificateAuthority;
pub use crl::Entity as Crl;
pub use dead_letter::Entity as DeadLetter;
pub use job::Entity as Job;
pub use revocation::Entity as Revocation;

pub mod prelude {
    pub use super::acme_account::Entity as AcmeAccount;
    pub use super::acme_authorization::Entity as AcmeAuthorization;
    pub use super::acme_challenge::Entity as AcmeChallenge;
    pub use super::acme_order::Entity as AcmeOrder;
    pub use super::certificate::Entity as Certificate;
    pub use super::certificate_authority::Entity as CertificateAuthority;
    pub use super::crl::Entity as Crl;
    pub use super::dead_letter::Entity as DeadLetter;
    pub use super::job::Entity as Job;
    pub use super::revocation::Entity as Revocation;
}
