//! Pinned Certificate Verification
//!
//! Dialers verify exactly one thing about the peer certificate: its common
//! name must be `<expectedName>:<dialedPort>`. The name half binds the
//! endpoint to the advertised session; the port half binds the certificate
//! to the socket actually dialed. Chain building and CA trust do not apply,
//! the certificates are self-signed and ephemeral to the session.

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::WebPkiSupportedAlgorithms;
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{CertificateError, DigitallySignedStruct, SignatureScheme};

/// `ServerCertVerifier` that pins the leaf CN to `name:port`
#[derive(Debug)]
pub struct PinnedCertVerifier {
    expected_name: String,
    expected_port: u16,
    algorithms: WebPkiSupportedAlgorithms,
}

impl PinnedCertVerifier {
    pub fn new(expected_name: &str, expected_port: u16) -> Self {
        Self {
            expected_name: expected_name.to_string(),
            expected_port,
            algorithms: rustls::crypto::ring::default_provider().signature_verification_algorithms,
        }
    }
}

impl ServerCertVerifier for PinnedCertVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        let cn = subject_common_name(end_entity.as_ref())
            .ok_or(rustls::Error::InvalidCertificate(CertificateError::BadEncoding))?;
        let Some((name, port)) = cn.rsplit_once(':') else {
            return Err(rustls::Error::InvalidCertificate(
                CertificateError::NotValidForName,
            ));
        };
        if name != self.expected_name || port.parse::<u16>().ok() != Some(self.expected_port) {
            return Err(rustls::Error::InvalidCertificate(
                CertificateError::NotValidForName,
            ));
        }
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(message, cert, dss, &self.algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(message, cert, dss, &self.algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.algorithms.supported_schemes()
    }
}

/// Extract the common name from a DER certificate by walking to the
/// commonName OID (2.5.4.3) and reading the string that follows. The
/// certificates here are self-signed, so issuer and subject CN coincide.
fn subject_common_name(der: &[u8]) -> Option<String> {
    const CN_OID: &[u8] = &[0x06, 0x03, 0x55, 0x04, 0x03];
    let mut idx = 0;
    while let Some(pos) = find_subsequence(&der[idx..], CN_OID) {
        let mut cursor = idx + pos + CN_OID.len();
        if cursor >= der.len() {
            return None;
        }
        let tag = der[cursor];
        // UTF8String or PrintableString
        if tag == 0x0c || tag == 0x13 {
            cursor += 1;
            let (len, consumed) = read_der_length(&der[cursor..])?;
            cursor += consumed;
            if cursor + len <= der.len() {
                return String::from_utf8(der[cursor..cursor + len].to_vec()).ok();
            }
            return None;
        }
        idx += pos + 1;
    }
    None
}

fn read_der_length(bytes: &[u8]) -> Option<(usize, usize)> {
    let first = *bytes.first()?;
    if first & 0x80 == 0 {
        return Some((first as usize, 1));
    }
    let num_bytes = (first & 0x7f) as usize;
    if num_bytes == 0 || num_bytes > 4 || bytes.len() < 1 + num_bytes {
        return None;
    }
    let mut len = 0usize;
    for &b in &bytes[1..=num_bytes] {
        len = (len << 8) | b as usize;
    }
    Some((len, 1 + num_bytes))
}

fn find_subsequence(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use lanmesh_crypto::cert::pinned_common_name;
    use lanmesh_crypto::{generate_rsa_key, self_signed_cert_der};

    #[tokio::test]
    async fn test_common_name_extraction() {
        let key = generate_rsa_key().await.unwrap();
        let cn = pinned_common_name("blorp-glork", 51234);
        let der = self_signed_cert_der(&key, &cn).unwrap();
        assert_eq!(subject_common_name(&der).as_deref(), Some(cn.as_str()));
    }

    #[test]
    fn test_der_length_forms() {
        assert_eq!(read_der_length(&[0x05]), Some((5, 1)));
        assert_eq!(read_der_length(&[0x81, 0x80]), Some((128, 2)));
        assert_eq!(read_der_length(&[0x82, 0x01, 0x00]), Some((256, 3)));
        assert_eq!(read_der_length(&[]), None);
    }
}
