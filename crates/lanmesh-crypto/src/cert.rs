//! Self-Signed X.509 Certificates
//!
//! Each TLS endpoint serves a self-signed RSA certificate whose common name
//! binds the advertised session name to the bound TCP port
//! (`CN = "<name>:<port>"`). Dialers verify that binding instead of chasing a
//! CA chain. Validity is one day; issuer equals subject.

use rand::RngCore;
use rcgen::{CertificateParams, DistinguishedName, DnType, KeyPair, SerialNumber, PKCS_RSA_SHA256};
use rustls_pki_types::PrivatePkcs8KeyDer;

use crate::constants::CERT_SERIAL_SIZE;
use crate::error::{CryptoError, CryptoResult};
use crate::keys::RsaKeyMaterial;

/// Build the pinned common name for an endpoint
pub fn pinned_common_name(name: &str, port: u16) -> String {
    format!("{name}:{port}")
}

/// Create a self-signed certificate (DER) over the given RSA key
pub fn self_signed_cert_der(key: &RsaKeyMaterial, common_name: &str) -> CryptoResult<Vec<u8>> {
    let key_der = PrivatePkcs8KeyDer::from(key.pkcs8_der());
    let key_pair = KeyPair::from_pkcs8_der_and_sign_algo(&key_der, &PKCS_RSA_SHA256)
        .map_err(|e| CryptoError::Certificate(e.to_string()))?;

    let mut params = CertificateParams::default();
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, common_name);
    params.distinguished_name = dn;

    let now = time::OffsetDateTime::now_utc();
    params.not_before = now;
    params.not_after = now + time::Duration::days(1);

    let mut serial = [0u8; CERT_SERIAL_SIZE];
    rand::rngs::OsRng.fill_bytes(&mut serial);
    // keep the DER INTEGER positive
    serial[0] &= 0x7f;
    params.serial_number = Some(SerialNumber::from(serial.to_vec()));

    let cert = params
        .self_signed(&key_pair)
        .map_err(|e| CryptoError::Certificate(e.to_string()))?;
    Ok(cert.der().to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::generate_rsa_key;

    fn contains(haystack: &[u8], needle: &[u8]) -> bool {
        haystack.windows(needle.len()).any(|w| w == needle)
    }

    #[tokio::test]
    async fn test_cert_carries_pinned_cn() {
        let key = generate_rsa_key().await.unwrap();
        let cn = pinned_common_name("blorp-glork", 51234);
        let der = self_signed_cert_der(&key, &cn).unwrap();
        assert!(contains(&der, cn.as_bytes()));
    }
}
