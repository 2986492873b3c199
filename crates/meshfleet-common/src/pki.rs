//! In-process certificate authority
//!
//! Backs the `archon` certificate manager: a self-signed CA whose key and
//! certificate are persisted in the CA bundle Secret, issuing leaf
//! certificates for the mesh ingress and the admission webhook.

use std::time::Duration;

use rcgen::{
    string::Ia5String, BasicConstraints, CertificateParams, DistinguishedName, DnType, DnValue,
    IsCa, Issuer, KeyPair, KeyUsagePurpose, SanType,
};
use thiserror::Error;

/// Validity of the CA certificate
pub const CA_VALIDITY: Duration = Duration::from_secs(10 * 365 * 24 * 3600);

/// PKI errors
#[derive(Debug, Error)]
pub enum PkiError {
    /// Certificate generation failed
    #[error("certificate generation failed: {0}")]
    CertificateGenerationFailed(String),

    /// Key generation failed
    #[error("key generation failed: {0}")]
    KeyGenerationFailed(String),

    /// Stored PEM material could not be parsed
    #[error("certificate parsing error: {0}")]
    ParseError(String),
}

impl From<PkiError> for crate::Error {
    fn from(e: PkiError) -> Self {
        crate::Error::internal_with_context("pki", e.to_string())
    }
}

/// Result type for PKI operations
pub type Result<T> = std::result::Result<T, PkiError>;

/// PEM material of an issued certificate
#[derive(Clone, Debug, PartialEq)]
pub struct IssuedCertificate {
    /// Leaf certificate
    pub cert_pem: String,
    /// Leaf private key
    pub key_pem: String,
    /// Issuing CA certificate
    pub ca_pem: String,
}

fn compute_validity(ttl: Duration) -> (::time::OffsetDateTime, ::time::OffsetDateTime) {
    let now = ::time::OffsetDateTime::now_utc();
    let secs = i64::try_from(ttl.as_secs()).unwrap_or(i64::MAX / 2);
    (now, now + ::time::Duration::seconds(secs))
}

fn distinguished_name(common_name: &str) -> DistinguishedName {
    let mut dn = DistinguishedName::new();
    dn.push(
        DnType::CommonName,
        DnValue::Utf8String(common_name.to_string()),
    );
    dn.push(
        DnType::OrganizationName,
        DnValue::Utf8String("meshfleet".to_string()),
    );
    dn
}

/// Self-signed CA
#[derive(Clone)]
pub struct CertificateAuthority {
    ca_key_pem: String,
    ca_cert_pem: String,
}

impl CertificateAuthority {
    /// Create a new self-signed CA
    pub fn new(common_name: &str) -> Result<Self> {
        let mut params = CertificateParams::default();
        params.distinguished_name = distinguished_name(common_name);
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
            KeyUsagePurpose::DigitalSignature,
        ];
        let (not_before, not_after) = compute_validity(CA_VALIDITY);
        params.not_before = not_before;
        params.not_after = not_after;

        let key_pair = KeyPair::generate().map_err(|e| {
            PkiError::KeyGenerationFailed(format!("failed to generate CA key: {}", e))
        })?;
        let cert = params.self_signed(&key_pair).map_err(|e| {
            PkiError::CertificateGenerationFailed(format!("failed to create CA cert: {}", e))
        })?;

        Ok(Self {
            ca_key_pem: key_pair.serialize_pem(),
            ca_cert_pem: cert.pem(),
        })
    }

    /// Load a CA from stored PEM material
    pub fn from_pem(cert_pem: &str, key_pem: &str) -> Result<Self> {
        let key = KeyPair::from_pem(key_pem)
            .map_err(|e| PkiError::ParseError(format!("failed to parse CA key: {}", e)))?;
        Issuer::from_ca_cert_pem(cert_pem, &key)
            .map_err(|e| PkiError::ParseError(format!("failed to parse CA cert: {}", e)))?;

        Ok(Self {
            ca_key_pem: key_pem.to_string(),
            ca_cert_pem: cert_pem.to_string(),
        })
    }

    /// CA certificate PEM
    pub fn ca_cert_pem(&self) -> &str {
        &self.ca_cert_pem
    }

    /// CA private key PEM
    pub fn ca_key_pem(&self) -> &str {
        &self.ca_key_pem
    }

    /// Issue a server certificate for `common_name` valid for `ttl`.
    ///
    /// `dns_names` become SANs; entries that parse as IP addresses become IP SANs.
    pub fn issue(
        &self,
        common_name: &str,
        ttl: Duration,
        dns_names: &[String],
    ) -> Result<IssuedCertificate> {
        let mut params = CertificateParams::default();
        params.distinguished_name = distinguished_name(common_name);
        params.is_ca = IsCa::NoCa;
        params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];
        params.extended_key_usages = vec![
            rcgen::ExtendedKeyUsagePurpose::ServerAuth,
            rcgen::ExtendedKeyUsagePurpose::ClientAuth,
        ];
        let (not_before, not_after) = compute_validity(ttl);
        params.not_before = not_before;
        params.not_after = not_after;

        params.subject_alt_names = dns_names
            .iter()
            .map(|san| {
                if let Ok(ip) = san.parse::<std::net::IpAddr>() {
                    Ok(SanType::IpAddress(ip))
                } else {
                    Ia5String::try_from(san.clone())
                        .map(SanType::DnsName)
                        .map_err(|e| {
                            PkiError::CertificateGenerationFailed(format!(
                                "invalid DNS name '{}': {}",
                                san, e
                            ))
                        })
                }
            })
            .collect::<Result<Vec<_>>>()?;

        let leaf_key = KeyPair::generate().map_err(|e| {
            PkiError::KeyGenerationFailed(format!("failed to generate leaf key: {}", e))
        })?;

        let ca_key = KeyPair::from_pem(&self.ca_key_pem)
            .map_err(|e| PkiError::ParseError(format!("failed to parse CA key: {}", e)))?;
        let issuer = Issuer::from_ca_cert_pem(&self.ca_cert_pem, &ca_key)
            .map_err(|e| PkiError::ParseError(format!("failed to create issuer: {}", e)))?;

        let cert = params.signed_by(&leaf_key, &issuer).map_err(|e| {
            PkiError::CertificateGenerationFailed(format!("failed to sign certificate: {}", e))
        })?;

        Ok(IssuedCertificate {
            cert_pem: cert.pem(),
            key_pem: leaf_key.serialize_pem(),
            ca_pem: self.ca_cert_pem.clone(),
        })
    }
}

/// Conventional DNS names of a Service
pub fn service_dns_names(name: &str, namespace: &str) -> Vec<String> {
    vec![
        name.to_string(),
        format!("{name}.{namespace}"),
        format!("{name}.{namespace}.svc"),
        format!("{name}.{namespace}.svc.cluster.local"),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ca_round_trips_through_pem() {
        let ca = CertificateAuthority::new("meshfleet-ca").unwrap();
        assert!(ca.ca_cert_pem().contains("BEGIN CERTIFICATE"));
        let loaded = CertificateAuthority::from_pem(ca.ca_cert_pem(), ca.ca_key_pem()).unwrap();
        assert_eq!(loaded.ca_cert_pem(), ca.ca_cert_pem());
    }

    #[test]
    fn issues_leaf_with_ca_bundle() {
        let ca = CertificateAuthority::new("meshfleet-ca").unwrap();
        let cert = ca
            .issue(
                "ingress",
                Duration::from_secs(3600),
                &service_dns_names("meshfleet-ingress", "meshfleet-system"),
            )
            .unwrap();
        assert!(cert.cert_pem.contains("BEGIN CERTIFICATE"));
        assert!(cert.key_pem.contains("PRIVATE KEY"));
        assert_eq!(cert.ca_pem, ca.ca_cert_pem());
        assert_ne!(cert.cert_pem, ca.ca_cert_pem());
    }

    #[test]
    fn ip_sans_are_accepted() {
        let ca = CertificateAuthority::new("meshfleet-ca").unwrap();
        assert!(ca
            .issue("webhook", Duration::from_secs(60), &["10.0.0.1".to_string()])
            .is_ok());
    }

    #[test]
    fn garbage_pem_is_rejected() {
        assert!(matches!(
            CertificateAuthority::from_pem("nope", "nope"),
            Err(PkiError::ParseError(_))
        ));
    }

    #[test]
    fn service_dns_names_cover_short_and_fqdn() {
        let names = service_dns_names("meshfleet-ingress", "meshfleet-system");
        assert_eq!(names.len(), 4);
        assert_eq!(names[3], "meshfleet-ingress.meshfleet-system.svc.cluster.local");
    }
}
