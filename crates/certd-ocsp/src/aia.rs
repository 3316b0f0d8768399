//! Authority Information Access extension pointing clients at the responder.

use der::asn1::{Ia5String, ObjectIdentifier};
use der::{Encode, Sequence};

use crate::OcspError;

/// `id-pe-authorityInfoAccess`
pub const OID_AUTHORITY_INFO_ACCESS: [u64; 9] = [1, 3, 6, 1, 5, 5, 7, 1, 1];

/// `id-ad-ocsp`
const OID_AD_OCSP: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.3.6.1.5.5.7.48.1");

/// ```text
/// AccessDescription  ::=  SEQUENCE {
///         accessMethod          OBJECT IDENTIFIER,
///         accessLocation        GeneralName  }
/// ```
///
/// Only the `uniformResourceIdentifier [6] IA5String` form of GeneralName is
/// produced.
#[derive(Clone, Debug, Eq, PartialEq, Sequence)]
struct AccessDescription {
    access_method: ObjectIdentifier,
    #[asn1(context_specific = "6", tag_mode = "IMPLICIT")]
    access_location: Ia5String,
}

/// DER value of an AIA extension carrying a single OCSP responder URL.
pub fn ocsp_aia_extension_value(responder_url: &str) -> Result<Vec<u8>, OcspError> {
    let location = Ia5String::new(responder_url)
        .map_err(|e| OcspError::Encoding(format!("invalid responder URL: {}", e)))?;
    let descriptions = vec![AccessDescription {
        access_method: OID_AD_OCSP,
        access_location: location,
    }];
    Ok(descriptions.to_der()?)
}
