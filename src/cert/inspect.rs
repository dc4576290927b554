// src/cert/inspect.rs
//! Field extraction from DER certificates and CSRs.
//!
//! openssl does the cryptography; x509-parser reads back what actually ended
//! up in the encoded structures so both sides of the signing protocol can
//! compare it against policy.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use x509_parser::prelude::{
    FromDer, GeneralName, ParsedExtension, X509Certificate, X509CertificationRequest, X509Name,
};

use crate::error::{PkiError, Result};

/// What a certificate asserts, in comparable form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertificateFields {
    pub common_name: String,
    pub organizations: Vec<String>,
    pub dns_names: Vec<String>,
    /// Canonical text form.
    pub ip_addresses: Vec<String>,
    /// `serverAuth`, `clientAuth`, other well-known names, or dotted OIDs.
    pub ext_key_usages: Vec<String>,
    pub is_ca: bool,
}

/// What a CSR requests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestFields {
    pub common_name: String,
    pub organizations: Vec<String>,
    pub dns_names: Vec<String>,
    pub ip_addresses: Vec<String>,
}

impl RequestFields {
    pub fn san_count(&self) -> usize {
        self.dns_names.len() + self.ip_addresses.len()
    }
}

pub fn inspect_certificate(der: &[u8]) -> Result<CertificateFields> {
    let (_, cert) = X509Certificate::from_der(der)
        .map_err(|e| PkiError::Validation(format!("decode certificate: {}", e)))?;

    let (common_name, organizations) = subject_fields(cert.subject())?;

    let mut dns_names = Vec::new();
    let mut ip_addresses = Vec::new();
    let san = cert
        .subject_alternative_name()
        .map_err(|e| PkiError::Validation(format!("decode SAN extension: {}", e)))?;
    if let Some(san) = san {
        collect_general_names(&san.value.general_names, &mut dns_names, &mut ip_addresses)?;
    }

    let mut ext_key_usages = Vec::new();
    let eku = cert
        .extended_key_usage()
        .map_err(|e| PkiError::Validation(format!("decode EKU extension: {}", e)))?;
    if let Some(eku) = eku {
        let eku = eku.value;
        let named = [
            (eku.any, "any"),
            (eku.server_auth, "serverAuth"),
            (eku.client_auth, "clientAuth"),
            (eku.code_signing, "codeSigning"),
            (eku.email_protection, "emailProtection"),
            (eku.time_stamping, "timeStamping"),
            (eku.ocsp_signing, "ocspSigning"),
        ];
        ext_key_usages.extend(
            named
                .iter()
                .filter(|(present, _)| *present)
                .map(|(_, name)| name.to_string()),
        );
        ext_key_usages.extend(eku.other.iter().map(|oid| oid.to_id_string()));
    }

    let is_ca = cert
        .basic_constraints()
        .map_err(|e| PkiError::Validation(format!("decode basic constraints: {}", e)))?
        .map(|bc| bc.value.ca)
        .unwrap_or(false);

    Ok(CertificateFields {
        common_name,
        organizations,
        dns_names,
        ip_addresses,
        ext_key_usages,
        is_ca,
    })
}

pub fn inspect_csr(der: &[u8]) -> Result<RequestFields> {
    let (_, csr) = X509CertificationRequest::from_der(der)
        .map_err(|e| PkiError::Validation(format!("decode CSR: {}", e)))?;

    let (common_name, organizations) = subject_fields(&csr.certification_request_info.subject)?;

    let mut dns_names = Vec::new();
    let mut ip_addresses = Vec::new();
    if let Some(extensions) = csr.requested_extensions() {
        for ext in extensions {
            if let ParsedExtension::SubjectAlternativeName(san) = ext {
                collect_general_names(&san.general_names, &mut dns_names, &mut ip_addresses)?;
            }
        }
    }

    Ok(RequestFields {
        common_name,
        organizations,
        dns_names,
        ip_addresses,
    })
}

/// Common name of a DER certificate; used for channel peer identities.
pub fn peer_common_name(der: &[u8]) -> Result<String> {
    let (_, cert) = X509Certificate::from_der(der)
        .map_err(|e| PkiError::Validation(format!("decode peer certificate: {}", e)))?;
    Ok(subject_fields(cert.subject())?.0)
}

fn subject_fields(name: &X509Name<'_>) -> Result<(String, Vec<String>)> {
    let common_name = match name.iter_common_name().next() {
        Some(attr) => attr
            .as_str()
            .map_err(|e| PkiError::Validation(format!("decode commonName: {}", e)))?
            .to_string(),
        None => String::new(),
    };
    let organizations = name
        .iter_organization()
        .map(|attr| {
            attr.as_str()
                .map(str::to_string)
                .map_err(|e| PkiError::Validation(format!("decode organization: {}", e)))
        })
        .collect::<Result<Vec<_>>>()?;
    Ok((common_name, organizations))
}

fn collect_general_names(
    names: &[GeneralName<'_>],
    dns_names: &mut Vec<String>,
    ip_addresses: &mut Vec<String>,
) -> Result<()> {
    for name in names {
        match name {
            GeneralName::DNSName(dns) => dns_names.push(dns.to_string()),
            GeneralName::IPAddress(bytes) => ip_addresses.push(ip_from_bytes(bytes)?.to_string()),
            _ => {}
        }
    }
    Ok(())
}

fn ip_from_bytes(bytes: &[u8]) -> Result<IpAddr> {
    if let Ok(v4) = <[u8; 4]>::try_from(bytes) {
        return Ok(IpAddr::V4(Ipv4Addr::from(v4)));
    }
    if let Ok(v6) = <[u8; 16]>::try_from(bytes) {
        return Ok(IpAddr::V6(Ipv6Addr::from(v6)));
    }
    Err(PkiError::Validation(format!(
        "IP SAN has invalid length {}",
        bytes.len()
    )))
}
