//! Certificate generation and validation for the agent TLS secret and the bootstrap helper

use rcgen::{
    string::Ia5String, BasicConstraints, CertificateParams, DistinguishedName, DnType, DnValue,
    ExtendedKeyUsagePurpose, IsCa, Issuer, KeyPair, KeyUsagePurpose, SanType,
};
use x509_parser::prelude::*;

use crate::{Error, Result};

/// Common name of the rotated CA and of the client certificate it signs
pub const SIGNER_NAME: &str = "ocm-klusterlet-logger";

pub const DEFAULT_VALIDITY_DAYS: i64 = 365;

pub const BOOTSTRAP_ORGANIZATION: &str = "OpenShift ACM";
pub const BOOTSTRAP_VALIDITY_DAYS: i64 = 10 * 365;

/// PEM encoded CA certificate, leaf certificate and leaf private key
#[derive(Clone, Debug)]
pub struct CertBundle {
    pub ca_pem: String,
    pub cert_pem: String,
    pub key_pem: String,
}

fn pki_error(what: &str) -> impl FnOnce(rcgen::Error) -> Error + '_ {
    move |e| Error::PkiError(format!("{what}: {e}"))
}

fn validity(days: i64) -> (::time::OffsetDateTime, ::time::OffsetDateTime) {
    let now = ::time::OffsetDateTime::now_utc();
    (now, now + ::time::Duration::days(days))
}

fn distinguished_name(common_name: &str, organization: Option<&str>) -> DistinguishedName {
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, DnValue::Utf8String(common_name.into()));
    if let Some(org) = organization {
        dn.push(DnType::OrganizationName, DnValue::Utf8String(org.into()));
    }
    dn
}

fn self_signed_ca(
    common_name: &str,
    organization: Option<&str>,
    days: i64,
) -> Result<(String, KeyPair)> {
    let mut params = CertificateParams::default();
    params.distinguished_name = distinguished_name(common_name, organization);
    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    params.key_usages = vec![
        KeyUsagePurpose::KeyCertSign,
        KeyUsagePurpose::CrlSign,
        KeyUsagePurpose::DigitalSignature,
    ];
    (params.not_before, params.not_after) = validity(days);

    let key = KeyPair::generate().map_err(pki_error("failed to generate CA key"))?;
    let cert = params
        .self_signed(&key)
        .map_err(pki_error("failed to create CA cert"))?;
    Ok((cert.pem(), key))
}

struct Leaf<'a> {
    common_name: &'a str,
    organization: Option<&'a str>,
    dns_names: &'a [&'a str],
    usages: Vec<ExtendedKeyUsagePurpose>,
    days: i64,
}

fn signed_leaf(leaf: Leaf<'_>, ca_pem: &str, ca_key: &KeyPair) -> Result<(String, String)> {
    let mut params = CertificateParams::default();
    params.distinguished_name = distinguished_name(leaf.common_name, leaf.organization);
    params.is_ca = IsCa::NoCa;
    params.key_usages = vec![
        KeyUsagePurpose::DigitalSignature,
        KeyUsagePurpose::KeyEncipherment,
    ];
    params.extended_key_usages = leaf.usages;
    (params.not_before, params.not_after) = validity(leaf.days);
    params.subject_alt_names = leaf
        .dns_names
        .iter()
        .map(|name| {
            Ia5String::try_from(name.to_string())
                .map(SanType::DnsName)
                .map_err(|e| Error::PkiError(format!("invalid DNS name '{name}': {e}")))
        })
        .collect::<Result<Vec<_>>>()?;

    let key = KeyPair::generate().map_err(pki_error("failed to generate key"))?;
    let issuer = Issuer::from_ca_cert_pem(ca_pem, ca_key)
        .map_err(pki_error("failed to create issuer"))?;
    let cert = params
        .signed_by(&key, &issuer)
        .map_err(pki_error("failed to sign certificate"))?;
    Ok((cert.pem(), key.serialize_pem()))
}

/// A fresh self-signed CA named [`SIGNER_NAME`] and a client certificate it signs
pub fn generate_client_bundle(validity_days: i64) -> Result<CertBundle> {
    let (ca_pem, ca_key) = self_signed_ca(SIGNER_NAME, None, validity_days)?;
    let (cert_pem, key_pem) = signed_leaf(
        Leaf {
            common_name: SIGNER_NAME,
            organization: None,
            dns_names: &[],
            usages: vec![ExtendedKeyUsagePurpose::ClientAuth],
            days: validity_days,
        },
        &ca_pem,
        &ca_key,
    )?;
    Ok(CertBundle {
        ca_pem,
        cert_pem,
        key_pem,
    })
}

/// CA and serving+client certificate for one bootstrap subject
pub fn generate_bootstrap_bundle(subject: &str, dns_names: &[&str]) -> Result<CertBundle> {
    let (ca_pem, ca_key) = self_signed_ca(
        subject,
        Some(BOOTSTRAP_ORGANIZATION),
        BOOTSTRAP_VALIDITY_DAYS,
    )?;
    let (cert_pem, key_pem) = signed_leaf(
        Leaf {
            common_name: subject,
            organization: Some(BOOTSTRAP_ORGANIZATION),
            dns_names,
            usages: vec![
                ExtendedKeyUsagePurpose::ServerAuth,
                ExtendedKeyUsagePurpose::ClientAuth,
            ],
            days: BOOTSTRAP_VALIDITY_DAYS,
        },
        &ca_pem,
        &ca_key,
    )?;
    Ok(CertBundle {
        ca_pem,
        cert_pem,
        key_pem,
    })
}

/// Parse PEM-encoded data and return the DER bytes
pub fn parse_pem(pem_data: &[u8]) -> Result<Vec<u8>> {
    let pem_obj = ::pem::parse(pem_data)
        .map_err(|e| Error::PkiError(format!("failed to parse PEM: {e}")))?;
    Ok(pem_obj.contents().to_vec())
}

#[derive(Clone, Debug, PartialEq)]
pub struct CertificateInfo {
    /// Unix timestamps
    pub not_before: i64,
    pub not_after: i64,
    pub subject_cn: String,
    pub issuer_cn: String,
}

impl CertificateInfo {
    pub fn from_pem(pem_data: &[u8]) -> Result<Self> {
        let der = parse_pem(pem_data)?;
        let (_, cert) = X509Certificate::from_der(&der)
            .map_err(|e| Error::PkiError(format!("failed to parse certificate: {e}")))?;
        let cn = |name: &X509Name<'_>| {
            name.iter_common_name()
                .next()
                .and_then(|cn| cn.as_str().ok())
                .unwrap_or_default()
                .to_string()
        };
        Ok(Self {
            not_before: cert.validity().not_before.timestamp(),
            not_after: cert.validity().not_after.timestamp(),
            subject_cn: cn(cert.subject()),
            issuer_cn: cn(cert.issuer()),
        })
    }

    /// Not yet valid, expired, or no more than a fifth of the validity window left
    pub fn needs_rotation(&self, now: i64) -> bool {
        let window = self.not_after - self.not_before;
        let remaining = self.not_after - now;
        now < self.not_before || remaining <= 0 || remaining.saturating_mul(5) <= window
    }
}

/// Why an existing bundle must be replaced, or None when it is still good
pub fn invalid_reason(ca_pem: &[u8], cert_pem: &[u8], now: i64) -> Option<String> {
    let ca = match CertificateInfo::from_pem(ca_pem) {
        Ok(ca) => ca,
        Err(e) => return Some(format!("bad CA: {e}")),
    };
    let cert = match CertificateInfo::from_pem(cert_pem) {
        Ok(cert) => cert,
        Err(e) => return Some(format!("bad certificate: {e}")),
    };
    if now >= cert.not_after {
        return Some("certificate expired".into());
    }
    if now < cert.not_before {
        return Some("certificate is not valid yet".into());
    }
    if cert.needs_rotation(now) {
        return Some("certificate is in the last fifth of its validity".into());
    }
    if cert.issuer_cn != ca.subject_cn {
        return Some(format!(
            "certificate issuer {:?} does not match CA {:?}",
            cert.issuer_cn, ca.subject_cn
        ));
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn now() -> i64 {
        ::time::OffsetDateTime::now_utc().unix_timestamp()
    }

    #[test]
    fn generated_client_bundle_is_valid() {
        let bundle = generate_client_bundle(DEFAULT_VALIDITY_DAYS).unwrap();
        assert_eq!(
            invalid_reason(bundle.ca_pem.as_bytes(), bundle.cert_pem.as_bytes(), now()),
            None
        );
        let info = CertificateInfo::from_pem(bundle.cert_pem.as_bytes()).unwrap();
        assert_eq!(info.subject_cn, SIGNER_NAME);
        assert_eq!(info.issuer_cn, SIGNER_NAME);
        assert!(KeyPair::from_pem(&bundle.key_pem).is_ok());
    }

    #[test]
    fn rotation_boundary_is_inclusive() {
        let info = CertificateInfo {
            not_before: 0,
            not_after: 1000,
            subject_cn: SIGNER_NAME.into(),
            issuer_cn: SIGNER_NAME.into(),
        };
        assert!(!info.needs_rotation(0));
        assert!(!info.needs_rotation(799));
        assert!(info.needs_rotation(800));
        assert!(info.needs_rotation(1000));
        assert!(info.needs_rotation(5000));
    }

    #[test]
    fn certificate_from_the_future_is_rotated() {
        let info = CertificateInfo {
            not_before: 1000,
            not_after: 2000,
            subject_cn: SIGNER_NAME.into(),
            issuer_cn: SIGNER_NAME.into(),
        };
        assert!(info.needs_rotation(999));
        assert!(!info.needs_rotation(1000));

        let bundle = generate_client_bundle(DEFAULT_VALIDITY_DAYS).unwrap();
        let yesterday = now() - 24 * 3600;
        assert_eq!(
            invalid_reason(bundle.ca_pem.as_bytes(), bundle.cert_pem.as_bytes(), yesterday)
                .as_deref(),
            Some("certificate is not valid yet")
        );
    }

    #[test]
    fn near_expiry_is_invalid() {
        let bundle = generate_client_bundle(DEFAULT_VALIDITY_DAYS).unwrap();
        let info = CertificateInfo::from_pem(bundle.cert_pem.as_bytes()).unwrap();
        let window = info.not_after - info.not_before;
        let at_four_fifths = info.not_before + window * 4 / 5 + 1;
        assert!(
            invalid_reason(bundle.ca_pem.as_bytes(), bundle.cert_pem.as_bytes(), at_four_fifths)
                .is_some()
        );
        assert!(invalid_reason(
            bundle.ca_pem.as_bytes(),
            bundle.cert_pem.as_bytes(),
            info.not_after + 1
        )
        .unwrap()
        .contains("expired"));
    }

    #[test]
    fn issuer_must_match_ca() {
        let client = generate_client_bundle(DEFAULT_VALIDITY_DAYS).unwrap();
        let other = generate_bootstrap_bundle("acm-agent", &[]).unwrap();
        let reason =
            invalid_reason(other.ca_pem.as_bytes(), client.cert_pem.as_bytes(), now()).unwrap();
        assert!(reason.contains("does not match"), "{reason}");
    }

    #[test]
    fn garbage_is_invalid() {
        assert!(invalid_reason(b"nope", b"nope", now()).is_some());
    }

    #[test]
    fn bootstrap_bundle_carries_subject() {
        let bundle = generate_bootstrap_bundle(
            "acm-apiserver",
            &["acm-proxyserver", "acm-proxyserver.open-cluster-management.svc"],
        )
        .unwrap();
        let ca = CertificateInfo::from_pem(bundle.ca_pem.as_bytes()).unwrap();
        let leaf = CertificateInfo::from_pem(bundle.cert_pem.as_bytes()).unwrap();
        assert_eq!(ca.subject_cn, "acm-apiserver");
        assert_eq!(leaf.issuer_cn, "acm-apiserver");
        assert!(leaf.not_after - leaf.not_before >= 3650 * 24 * 3600 - 60);
    }
}
