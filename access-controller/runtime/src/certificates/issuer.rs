//! Generation and inspection of TLS key material.

use rcgen::{
    string::Ia5String, BasicConstraints, CertificateParams, DistinguishedName, DnType, DnValue,
    ExtendedKeyUsagePurpose, IsCa, KeyUsagePurpose, SanType,
};
use serde::{Deserialize, Serialize};
use std::{collections::BTreeSet, net::IpAddr, time::Duration};
use x509_parser::prelude::*;

/// Issues and decodes certificates.
pub trait Issuer: Send + Sync {
    fn issue(&self, request: &IssueRequest<'_>) -> Result<KeyPair, IssueError>;

    /// Reads the fields that decide whether a certificate is still correct.
    fn decode(&self, cert_pem: &[u8]) -> Result<ParsedCertificate, IssueError>;
}

/// What to put in a new certificate.
#[derive(Clone, Debug)]
pub struct IssueRequest<'a> {
    pub subject: &'a str,
    pub hosts: &'a [String],
    pub validity: Duration,
    pub client: bool,
    pub server: bool,
    /// Issue a CA that can sign other certificates.
    pub signing: bool,
    /// The CA to sign with. A self-signed certificate is issued if unset.
    pub ca: Option<&'a KeyPair>,
}

/// PEM encoded key material, laid out as in a TLS secret.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct KeyPair {
    pub cert_pem: String,
    pub key_pem: String,
    pub ca_pem: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParsedCertificate {
    pub subject: String,
    #[serde(default)]
    pub dns_names: Vec<String>,
    #[serde(default)]
    pub ip_addresses: Vec<IpAddr>,
    /// Unix timestamp of notAfter.
    pub not_after: i64,
}

#[derive(Debug, thiserror::Error)]
pub enum IssueError {
    #[error("failed to generate certificate: {0}")]
    Generate(#[from] rcgen::Error),

    #[error("invalid host name {0:?}")]
    InvalidHost(String),

    #[error("certificate validity is out of range")]
    Validity,

    #[error("failed to decode certificate: {0}")]
    Decode(String),
}

/// Issues certificates with `rcgen`.
#[derive(Clone, Debug, Default)]
pub struct RcgenIssuer(());

// === impl ParsedCertificate ===

impl ParsedCertificate {
    /// The names the certificate is valid for: every non-empty DNS name and
    /// every IP address.
    pub fn hosts(&self) -> BTreeSet<String> {
        self.dns_names
            .iter()
            .filter(|h| !h.is_empty())
            .cloned()
            .chain(self.ip_addresses.iter().map(ToString::to_string))
            .collect()
    }

    pub fn is_expired(&self, now: i64) -> bool {
        self.not_after <= now
    }

    /// notAfter in RFC 3339 form.
    pub fn expiration(&self) -> String {
        ::time::OffsetDateTime::from_unix_timestamp(self.not_after)
            .ok()
            .and_then(|t| {
                t.format(&::time::format_description::well_known::Rfc3339)
                    .ok()
            })
            .unwrap_or_default()
    }
}

// === impl RcgenIssuer ===

impl RcgenIssuer {
    pub fn new() -> Self {
        Self(())
    }
}

impl Issuer for RcgenIssuer {
    fn issue(&self, request: &IssueRequest<'_>) -> Result<KeyPair, IssueError> {
        let mut params = CertificateParams::default();

        let mut dn = DistinguishedName::new();
        dn.push(
            DnType::CommonName,
            DnValue::Utf8String(request.subject.to_string()),
        );
        params.distinguished_name = dn;

        let validity = ::time::Duration::try_from(request.validity).map_err(|_| IssueError::Validity)?;
        let now = ::time::OffsetDateTime::now_utc();
        params.not_before = now;
        params.not_after = now.checked_add(validity).ok_or(IssueError::Validity)?;

        if request.signing {
            params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
            params.key_usages = vec![
                KeyUsagePurpose::KeyCertSign,
                KeyUsagePurpose::CrlSign,
                KeyUsagePurpose::DigitalSignature,
            ];
        } else {
            params.is_ca = IsCa::NoCa;
            params.key_usages = vec![
                KeyUsagePurpose::DigitalSignature,
                KeyUsagePurpose::KeyEncipherment,
            ];
            if request.server {
                params
                    .extended_key_usages
                    .push(ExtendedKeyUsagePurpose::ServerAuth);
            }
            if request.client {
                params
                    .extended_key_usages
                    .push(ExtendedKeyUsagePurpose::ClientAuth);
            }
            params.subject_alt_names = request
                .hosts
                .iter()
                .filter(|h| !h.is_empty())
                .map(|host| match host.parse::<IpAddr>() {
                    Ok(ip) => Ok(SanType::IpAddress(ip)),
                    Err(_) => Ia5String::try_from(host.clone())
                        .map(SanType::DnsName)
                        .map_err(|_| IssueError::InvalidHost(host.clone())),
                })
                .collect::<Result<Vec<_>, _>>()?;
        }

        let key = rcgen::KeyPair::generate()?;
        let key_pem = key.serialize_pem();
        match request.ca {
            Some(ca) => {
                let ca_key = rcgen::KeyPair::from_pem(&ca.key_pem)?;
                let issuer = rcgen::Issuer::from_ca_cert_pem(&ca.cert_pem, &ca_key)?;
                let cert = params.signed_by(&key, &issuer)?;
                Ok(KeyPair {
                    cert_pem: cert.pem(),
                    key_pem,
                    ca_pem: ca.cert_pem.clone(),
                })
            }
            None => {
                let cert = params.self_signed(&key)?;
                let cert_pem = cert.pem();
                Ok(KeyPair {
                    ca_pem: cert_pem.clone(),
                    cert_pem,
                    key_pem,
                })
            }
        }
    }

    fn decode(&self, cert_pem: &[u8]) -> Result<ParsedCertificate, IssueError> {
        let pem = ::pem::parse(cert_pem).map_err(|e| IssueError::Decode(e.to_string()))?;
        let (_, cert) = X509Certificate::from_der(pem.contents())
            .map_err(|e| IssueError::Decode(e.to_string()))?;

        let subject = cert
            .subject()
            .iter_common_name()
            .next()
            .and_then(|cn| cn.as_str().ok())
            .unwrap_or_default()
            .to_string();

        let mut parsed = ParsedCertificate {
            subject,
            not_after: cert.validity().not_after.timestamp(),
            ..Default::default()
        };
        let san = cert
            .subject_alternative_name()
            .map_err(|e| IssueError::Decode(e.to_string()))?;
        for name in san.iter().flat_map(|ext| ext.value.general_names.iter()) {
            match name {
                GeneralName::DNSName(dns) => parsed.dns_names.push(dns.to_string()),
                GeneralName::IPAddress(bytes) => {
                    if let Some(ip) = ip_from_bytes(bytes) {
                        parsed.ip_addresses.push(ip);
                    }
                }
                _ => {}
            }
        }
        Ok(parsed)
    }
}

fn ip_from_bytes(bytes: &[u8]) -> Option<IpAddr> {
    match bytes.len() {
        4 => <[u8; 4]>::try_from(bytes).ok().map(IpAddr::from),
        16 => <[u8; 16]>::try_from(bytes).ok().map(IpAddr::from),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const YEAR: Duration = Duration::from_secs(365 * 24 * 60 * 60);

    fn hosts(hs: &[&str]) -> Vec<String> {
        hs.iter().map(ToString::to_string).collect()
    }

    #[test]
    fn issues_ca_and_signed_leaf() {
        let issuer = RcgenIssuer::new();
        let ca = issuer
            .issue(&IssueRequest {
                subject: "skupper-site-ca",
                hosts: &[],
                validity: 5 * YEAR,
                client: false,
                server: false,
                signing: true,
                ca: None,
            })
            .expect("CA must be issued");
        assert_eq!(ca.ca_pem, ca.cert_pem);

        let requested = hosts(&["mysvc", "mysvc.test", "10.1.1.10"]);
        let leaf = issuer
            .issue(&IssueRequest {
                subject: "mysvc",
                hosts: &requested,
                validity: YEAR,
                client: false,
                server: true,
                signing: false,
                ca: Some(&ca),
            })
            .expect("leaf must be issued");
        assert_eq!(leaf.ca_pem, ca.cert_pem);

        let parsed = issuer
            .decode(leaf.cert_pem.as_bytes())
            .expect("leaf must decode");
        assert_eq!(parsed.subject, "mysvc");
        assert_eq!(
            parsed.hosts(),
            requested.into_iter().collect::<BTreeSet<_>>()
        );
        assert!(!parsed.is_expired(::time::OffsetDateTime::now_utc().unix_timestamp()));
        assert!(parsed.expiration().ends_with('Z'));
    }

    #[test]
    fn rejects_garbage() {
        assert!(RcgenIssuer::new().decode(b"not a certificate").is_err());
    }
}
