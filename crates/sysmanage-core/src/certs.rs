//! Client certificate issuance.
//!
//! A self-signed root CA issues per-host X.509 client certificates on
//! approval. Certificates bind the host's FQDN (subject CN + SAN) and its
//! host id (OU), and carry a random 128-bit serial the session handshake
//! uses to look the host back up. Pure-Rust via `rcgen` — no OpenSSL.

use rand::RngCore;
use rcgen::{
    BasicConstraints, Certificate, CertificateParams, DistinguishedName, DnType, IsCa, KeyPair,
    SerialNumber,
};
use tracing::info;
use uuid::Uuid;

use crate::error::CertError;

/// A certificate issued to an approved host.
#[derive(Debug, Clone)]
pub struct IssuedCertificate {
    /// PEM-encoded client certificate.
    pub certificate_pem: String,
    /// PEM-encoded private key, delivered to the agent once and not stored.
    pub private_key_pem: String,
    /// PEM-encoded issuing CA certificate.
    pub ca_certificate_pem: String,
    /// Serial number (hex), persisted on the host row for session lookup.
    pub serial: String,
}

/// The server's certificate authority.
pub struct CertificateAuthority {
    ca_cert: Certificate,
    ca_key: KeyPair,
}

impl CertificateAuthority {
    /// Generate a fresh self-signed root CA with the given common name.
    ///
    /// # Errors
    ///
    /// Returns [`CertError::Generation`] if key or certificate generation
    /// fails, [`CertError::InvalidRequest`] if the common name is empty.
    pub fn generate(common_name: &str) -> Result<Self, CertError> {
        if common_name.is_empty() {
            return Err(CertError::InvalidRequest {
                reason: "common_name is required".to_owned(),
            });
        }

        let mut params =
            CertificateParams::new(Vec::<String>::new()).map_err(|e| CertError::Generation {
                reason: format!("failed to create CA params: {e}"),
            })?;
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);

        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, common_name);
        dn.push(DnType::OrganizationName, "SysManage");
        params.distinguished_name = dn;

        let ca_key = KeyPair::generate().map_err(|e| CertError::Generation {
            reason: format!("CA key generation failed: {e}"),
        })?;

        let ca_cert = params
            .self_signed(&ca_key)
            .map_err(|e| CertError::Generation {
                reason: format!("CA self-signing failed: {e}"),
            })?;

        info!(common_name, "certificate authority generated");

        Ok(Self { ca_cert, ca_key })
    }

    /// The CA certificate in PEM form, for agent trust bundles.
    #[must_use]
    pub fn ca_certificate_pem(&self) -> String {
        self.ca_cert.pem()
    }

    /// Issue a client certificate bound to a host's FQDN and id.
    ///
    /// # Errors
    ///
    /// Returns [`CertError::InvalidRequest`] for an empty FQDN,
    /// [`CertError::Generation`] if generation fails.
    pub fn issue_client_certificate(
        &self,
        fqdn: &str,
        host_id: Uuid,
    ) -> Result<IssuedCertificate, CertError> {
        if fqdn.is_empty() {
            return Err(CertError::InvalidRequest {
                reason: "fqdn is required".to_owned(),
            });
        }

        let mut params =
            CertificateParams::new(vec![fqdn.to_owned()]).map_err(|e| CertError::Generation {
                reason: format!("failed to create cert params: {e}"),
            })?;

        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, fqdn);
        dn.push(DnType::OrganizationalUnitName, host_id.to_string());
        params.distinguished_name = dn;

        let mut serial_bytes = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut serial_bytes);
        let serial = hex::encode(serial_bytes);
        params.serial_number = Some(SerialNumber::from(serial_bytes.to_vec()));

        let key_pair = KeyPair::generate().map_err(|e| CertError::Generation {
            reason: format!("client key generation failed: {e}"),
        })?;

        let cert = params
            .signed_by(&key_pair, &self.ca_cert, &self.ca_key)
            .map_err(|e| CertError::Generation {
                reason: format!("client certificate signing failed: {e}"),
            })?;

        info!(fqdn, host_id = %host_id, serial = %serial, "client certificate issued");

        Ok(IssuedCertificate {
            certificate_pem: cert.pem(),
            private_key_pem: key_pair.serialize_pem(),
            ca_certificate_pem: self.ca_cert.pem(),
            serial,
        })
    }
}

impl std::fmt::Debug for CertificateAuthority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CertificateAuthority").finish_non_exhaustive()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn issues_pem_certificate_with_serial() {
        let ca = CertificateAuthority::generate("sysmanage-test-ca").unwrap();
        let issued = ca
            .issue_client_certificate("agent01.example.com", Uuid::new_v4())
            .unwrap();

        assert!(issued.certificate_pem.contains("BEGIN CERTIFICATE"));
        assert!(issued.private_key_pem.contains("PRIVATE KEY"));
        assert!(issued.ca_certificate_pem.contains("BEGIN CERTIFICATE"));
        assert_eq!(issued.serial.len(), 32);
    }

    #[test]
    fn serials_are_unique_per_issue() {
        let ca = CertificateAuthority::generate("sysmanage-test-ca").unwrap();
        let a = ca
            .issue_client_certificate("a.example.com", Uuid::new_v4())
            .unwrap();
        let b = ca
            .issue_client_certificate("b.example.com", Uuid::new_v4())
            .unwrap();
        assert_ne!(a.serial, b.serial);
    }

    #[test]
    fn empty_inputs_are_rejected() {
        assert!(matches!(
            CertificateAuthority::generate(""),
            Err(CertError::InvalidRequest { .. })
        ));
        let ca = CertificateAuthority::generate("ca").unwrap();
        assert!(matches!(
            ca.issue_client_certificate("", Uuid::new_v4()),
            Err(CertError::InvalidRequest { .. })
        ));
    }
}
