// src/cert/openssl.rs
use chrono::Utc;
use openssl::asn1::{Asn1Integer, Asn1Time};
use openssl::bn::{BigNum, MsbOption};
use openssl::hash::MessageDigest;
use openssl::nid::Nid;
use openssl::pkey::{HasPublic, PKey, PKeyRef, Private, Public};
use openssl::rsa::Rsa;
use openssl::stack::Stack;
use openssl::x509::extension::{
    AuthorityKeyIdentifier, BasicConstraints, ExtendedKeyUsage as EkuBuilder, KeyUsage,
    SubjectAlternativeName, SubjectKeyIdentifier,
};
use openssl::x509::{
    X509Extension, X509Name, X509NameRef, X509Ref, X509Req, X509ReqBuilder, X509v3Context, X509,
};

use super::types::{ExtKeyUsage, IdentitySpec, SplitSans};
use crate::error::{PkiError, Result};

pub const AUTHORITY_KEY_BITS: u32 = 4096;
pub const LEAF_KEY_BITS: u32 = 2048;

const X509_VERSION_3: i32 = 2;
const CSR_VERSION_1: i32 = 0;
const AUTHORITY_PATH_LENGTH: u32 = 1;
const SERIAL_BITS: i32 = 127;

const CLOCK_SKEW_SECS: i64 = 60 * 60;
const AUTHORITY_LIFETIME_SECS: i64 = 10 * 365 * 24 * 60 * 60;
const LEAF_LIFETIME_SECS: i64 = 365 * 24 * 60 * 60;

pub fn generate_private_key(bits: u32) -> Result<PKey<Private>> {
    let rsa = Rsa::generate(bits)
        .map_err(|e| PkiError::Internal(format!("generate {}-bit RSA key: {}", bits, e)))?;
    Ok(PKey::from_rsa(rsa)?)
}

/// PKCS#1 `RSA PRIVATE KEY` PEM.
pub fn private_key_to_pem(key: &PKeyRef<Private>) -> Result<Vec<u8>> {
    Ok(key.rsa()?.private_key_to_pem()?)
}

/// SPKI `PUBLIC KEY` PEM.
pub fn public_key_to_pem<T: HasPublic>(key: &PKeyRef<T>) -> Result<Vec<u8>> {
    Ok(key.public_key_to_pem()?)
}

pub fn parse_certificate_pem(pem: &[u8]) -> Result<X509> {
    if pem.is_empty() {
        return Err(PkiError::Validation("certificate PEM is empty".to_string()));
    }
    X509::from_pem(pem).map_err(|e| PkiError::Validation(format!("parse certificate: {}", e)))
}

pub fn parse_csr_pem(pem: &[u8]) -> Result<X509Req> {
    if pem.is_empty() {
        return Err(PkiError::Validation("CSR PEM is empty".to_string()));
    }
    X509Req::from_pem(pem).map_err(|e| PkiError::Validation(format!("parse CSR: {}", e)))
}

/// Accepts PKCS#1 and PKCS#8 encodings; anything but RSA is refused.
pub fn parse_private_key_pem(pem: &[u8]) -> Result<PKey<Private>> {
    let key = PKey::private_key_from_pem(pem)
        .map_err(|e| PkiError::Validation(format!("parse private key: {}", e)))?;
    key.rsa()
        .map_err(|_| PkiError::Validation("private key is not RSA".to_string()))?;
    Ok(key)
}

pub fn parse_public_key_pem(pem: &[u8]) -> Result<PKey<Public>> {
    let key = PKey::public_key_from_pem(pem)
        .map_err(|e| PkiError::Validation(format!("parse public key: {}", e)))?;
    key.rsa()
        .map_err(|_| PkiError::Validation("public key is not RSA".to_string()))?;
    Ok(key)
}

/// Algebraic RSA comparison: equal modulus and public exponent.
pub fn rsa_public_keys_match<A: HasPublic, B: HasPublic>(
    a: &PKeyRef<A>,
    b: &PKeyRef<B>,
) -> Result<bool> {
    let a = a
        .rsa()
        .map_err(|_| PkiError::Validation("certificate public key is not RSA".to_string()))?;
    let b = b
        .rsa()
        .map_err(|_| PkiError::Validation("public key is not RSA".to_string()))?;
    Ok(a.n() == b.n() && a.e() == b.e())
}

pub fn random_serial() -> Result<Asn1Integer> {
    let mut serial = BigNum::new()?;
    serial.rand(SERIAL_BITS, MsbOption::MAYBE_ZERO, false)?;
    Ok(serial.to_asn1_integer()?)
}

fn validity_window(lifetime_secs: i64) -> Result<(Asn1Time, Asn1Time)> {
    let now = Utc::now().timestamp();
    let not_before = Asn1Time::from_unix(now - CLOCK_SKEW_SECS)?;
    let not_after = Asn1Time::from_unix(now + lifetime_secs)?;
    Ok((not_before, not_after))
}

pub fn build_name<S: AsRef<str>>(common_name: &str, organizations: &[S]) -> Result<X509Name> {
    let mut name = X509Name::builder()?;
    for org in organizations {
        name.append_entry_by_nid(Nid::ORGANIZATIONNAME, org.as_ref())?;
    }
    name.append_entry_by_nid(Nid::COMMONNAME, common_name)?;
    Ok(name.build())
}

fn san_extension(sans: &SplitSans, ctx: &X509v3Context<'_>) -> Result<X509Extension> {
    let mut san = SubjectAlternativeName::new();
    for dns in &sans.dns_names {
        san.dns(dns);
    }
    for ip in sans.ip_strings() {
        san.ip(&ip);
    }
    Ok(san.build(ctx)?)
}

fn eku_extension(usages: &[ExtKeyUsage]) -> Result<X509Extension> {
    let mut eku = EkuBuilder::new();
    for usage in usages {
        match usage {
            ExtKeyUsage::ServerAuth => {
                eku.server_auth();
            }
            ExtKeyUsage::ClientAuth => {
                eku.client_auth();
            }
        }
    }
    Ok(eku.build()?)
}

/// Self-signed root: the issuer name is set to the certificate's own subject
/// and the signature is made with the certificate's own key.
pub fn self_signed_authority(common_name: &str, key: &PKeyRef<Private>) -> Result<X509> {
    let name = build_name::<&str>(common_name, &[])?;
    let (not_before, not_after) = validity_window(AUTHORITY_LIFETIME_SECS)?;

    let mut builder = X509::builder()?;
    builder.set_version(X509_VERSION_3)?;
    builder.set_serial_number(&*random_serial()?)?;
    builder.set_subject_name(&name)?;
    builder.set_issuer_name(&name)?;
    builder.set_not_before(&not_before)?;
    builder.set_not_after(&not_after)?;
    builder.set_pubkey(key)?;

    builder.append_extension(
        BasicConstraints::new()
            .critical()
            .ca()
            .pathlen(AUTHORITY_PATH_LENGTH)
            .build()?,
    )?;
    builder.append_extension(KeyUsage::new().critical().key_cert_sign().crl_sign().build()?)?;
    let ski = SubjectKeyIdentifier::new().build(&builder.x509v3_context(None, None))?;
    builder.append_extension(ski)?;

    builder.sign(key, MessageDigest::sha256())?;
    Ok(builder.build())
}

/// Signs a leaf for `public_key` under `issuer`. The subject, SANs and
/// usages are taken verbatim from the caller; validity is one hour in the
/// past through one year ahead.
pub fn sign_leaf<T: HasPublic>(
    subject: &X509NameRef,
    public_key: &PKeyRef<T>,
    sans: &SplitSans,
    usages: &[ExtKeyUsage],
    issuer_cert: &X509Ref,
    issuer_key: &PKeyRef<Private>,
) -> Result<X509> {
    let (not_before, not_after) = validity_window(LEAF_LIFETIME_SECS)?;

    let mut builder = X509::builder()?;
    builder.set_version(X509_VERSION_3)?;
    builder.set_serial_number(&*random_serial()?)?;
    builder.set_subject_name(subject)?;
    builder.set_issuer_name(issuer_cert.subject_name())?;
    builder.set_not_before(&not_before)?;
    builder.set_not_after(&not_after)?;
    builder.set_pubkey(public_key)?;

    builder.append_extension(BasicConstraints::new().critical().build()?)?;
    builder.append_extension(
        KeyUsage::new()
            .critical()
            .digital_signature()
            .key_encipherment()
            .build()?,
    )?;
    if !usages.is_empty() {
        builder.append_extension(eku_extension(usages)?)?;
    }
    if !sans.is_empty() {
        let ext = san_extension(sans, &builder.x509v3_context(Some(issuer_cert), None))?;
        builder.append_extension(ext)?;
    }
    let aki = AuthorityKeyIdentifier::new()
        .keyid(false)
        .issuer(false)
        .build(&builder.x509v3_context(Some(issuer_cert), None))?;
    builder.append_extension(aki)?;

    builder.sign(issuer_key, MessageDigest::sha256())?;
    Ok(builder.build())
}

/// CSR carrying the requested subject and SANs, self-signed with `key`.
pub fn build_csr(spec: &IdentitySpec, key: &PKeyRef<Private>) -> Result<X509Req> {
    let name = build_name(&spec.common_name, &spec.normalized_organizations())?;

    let mut builder = X509ReqBuilder::new()?;
    builder.set_version(CSR_VERSION_1)?;
    builder.set_subject_name(&name)?;
    builder.set_pubkey(key)?;

    let sans = spec.split_sans();
    if !sans.is_empty() {
        let mut extensions = Stack::new()?;
        extensions.push(san_extension(&sans, &builder.x509v3_context(None))?)?;
        builder.add_extensions(&extensions)?;
    }

    builder.sign(key, MessageDigest::sha256())?;
    Ok(builder.build())
}

#[cfg(test)]
mod tests {
    use super::*;
    use openssl::x509::X509VerifyResult;

    #[test]
    fn authority_is_self_issued_and_self_verifying() {
        let key = generate_private_key(LEAF_KEY_BITS).unwrap();
        let ca = self_signed_authority("test-ca", &key).unwrap();
        assert_eq!(ca.issued(&ca), X509VerifyResult::OK);
        assert!(ca.verify(&*key).unwrap());
    }

    #[test]
    fn csr_is_self_signed_by_its_key() {
        let key = generate_private_key(LEAF_KEY_BITS).unwrap();
        let spec = IdentitySpec::new("kube-apiserver").sans(["127.0.0.1", "localhost"]);
        let csr = build_csr(&spec, &key).unwrap();
        let public = csr.public_key().unwrap();
        assert!(csr.verify(&*public).unwrap());
        assert!(rsa_public_keys_match(&*public, &*key).unwrap());
    }

    #[test]
    fn key_pem_round_trips_and_rejects_garbage() {
        let key = generate_private_key(LEAF_KEY_BITS).unwrap();
        let pem = private_key_to_pem(&key).unwrap();
        assert!(String::from_utf8_lossy(&pem).contains("RSA PRIVATE KEY"));
        let parsed = parse_private_key_pem(&pem).unwrap();
        assert!(rsa_public_keys_match(&*parsed, &*key).unwrap());

        assert!(parse_private_key_pem(b"not a key").is_err());
        assert!(parse_certificate_pem(b"").is_err());
    }
}
