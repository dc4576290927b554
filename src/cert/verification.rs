// src/cert/verification.rs
//! Requester-side checks on a certificate returned by a signer. Nothing the
//! signer returns is trusted until every check here has passed.

use openssl::pkey::{HasPublic, PKeyRef, Private};
use openssl::x509::{X509Ref, X509};
use tracing::debug;

use super::inspect::inspect_certificate;
use super::openssl::{
    parse_certificate_pem, parse_private_key_pem, parse_public_key_pem, rsa_public_keys_match,
};
use super::types::{normalize_string_set, IdentitySpec};
use crate::error::{PkiError, Result};

/// Cryptographic chain check: `leaf`'s signature must verify under the
/// authority's public key. Names are not compared.
pub fn verify_signed_by(leaf: &X509Ref, authority: &X509Ref) -> Result<()> {
    let authority_key = authority.public_key()?;
    // A signature made by another key surfaces as either Ok(false) or an
    // error stack depending on the OpenSSL build.
    if leaf.verify(&*authority_key).unwrap_or(false) {
        Ok(())
    } else {
        Err(PkiError::Validation(
            "certificate signature does not verify against the expected authority".to_string(),
        ))
    }
}

/// The certificate's public key must be the public half of `private_key`.
pub fn verify_key_match<T: HasPublic>(cert: &X509Ref, private_key: &PKeyRef<T>) -> Result<()> {
    if rsa_public_keys_match(&*cert.public_key()?, private_key)? {
        Ok(())
    } else {
        Err(PkiError::KeyMismatch)
    }
}

/// Compares subject, SANs and usages of `cert` against `spec` as normalized
/// sets. The first disagreeing field is reported with both values.
pub fn verify_matches_spec(cert: &X509Ref, spec: &IdentitySpec) -> Result<()> {
    let fields = inspect_certificate(&cert.to_der()?)?;

    if fields.common_name != spec.common_name {
        return Err(PkiError::FieldMismatch {
            field: "commonName",
            expected: vec![spec.common_name.clone()],
            actual: vec![fields.common_name],
        });
    }

    let wanted_sans = spec.split_sans();
    let wanted_usages: Vec<String> = spec
        .normalized_usages()
        .iter()
        .map(ToString::to_string)
        .collect();

    let checks: [(&'static str, Vec<String>, Vec<String>); 4] = [
        (
            "organization",
            spec.normalized_organizations(),
            normalize_string_set(&fields.organizations),
        ),
        (
            "dns SAN",
            normalize_string_set(&wanted_sans.dns_names),
            normalize_string_set(&fields.dns_names),
        ),
        (
            "ip SAN",
            normalize_string_set(&wanted_sans.ip_strings()),
            normalize_string_set(&fields.ip_addresses),
        ),
        (
            "extended key usage",
            normalize_string_set(&wanted_usages),
            normalize_string_set(&fields.ext_key_usages),
        ),
    ];
    for (field, expected, actual) in checks {
        if expected != actual {
            return Err(PkiError::FieldMismatch {
                field,
                expected,
                actual,
            });
        }
    }
    Ok(())
}

/// Full validation of a signer's answer to a CSR: not a CA, chained to the
/// expected authority, matching the requested spec, and bound to the key
/// the requester generated.
pub fn validate_signed_leaf(
    cert_pem: &[u8],
    authority: &X509Ref,
    spec: &IdentitySpec,
    private_key: &PKeyRef<Private>,
) -> Result<X509> {
    let cert = parse_certificate_pem(cert_pem)?;
    if inspect_certificate(&cert.to_der()?)?.is_ca {
        return Err(PkiError::Validation(
            "signer returned a CA certificate for a leaf request".to_string(),
        ));
    }
    verify_signed_by(&cert, authority)?;
    verify_matches_spec(&cert, spec)?;
    verify_key_match(&cert, private_key)?;
    debug!(identity = %spec.common_name, "signed leaf passed validation");
    Ok(cert)
}

/// Checks that a service-account style pair (SPKI public key PEM plus RSA
/// private key PEM) belongs together.
pub fn public_key_pair_matches(public_pem: &[u8], private_pem: &[u8]) -> Result<()> {
    let public = parse_public_key_pem(public_pem)?;
    let private = parse_private_key_pem(private_pem)?;
    if rsa_public_keys_match(&*public, &*private)? {
        Ok(())
    } else {
        Err(PkiError::KeyMismatch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cert::ca::AuthorityMaterial;
    use crate::cert::issuer::issue_leaf;
    use crate::cert::openssl::{generate_private_key, LEAF_KEY_BITS};
    use crate::cert::types::ExtKeyUsage;

    fn admin_spec() -> IdentitySpec {
        IdentitySpec::new("kubernetes-admin")
            .organization("system:masters")
            .usages(&[ExtKeyUsage::ClientAuth])
    }

    #[test]
    fn locally_issued_leaf_validates() {
        let ca = AuthorityMaterial::generate("kubernetes-ca").unwrap();
        let pair = issue_leaf(&ca, &admin_spec()).unwrap();
        let key = parse_private_key_pem(pair.key_bytes()).unwrap();

        validate_signed_leaf(&pair.cert_pem, ca.certificate(), &admin_spec(), &key).unwrap();
    }

    #[test]
    fn wrong_authority_fails_chain_check() {
        let ca = AuthorityMaterial::generate("kubernetes-ca").unwrap();
        let unrelated = AuthorityMaterial::generate("kubernetes-ca").unwrap();
        let pair = issue_leaf(&ca, &admin_spec()).unwrap();
        let key = parse_private_key_pem(pair.key_bytes()).unwrap();

        let err =
            validate_signed_leaf(&pair.cert_pem, unrelated.certificate(), &admin_spec(), &key)
                .unwrap_err();
        assert!(matches!(err, PkiError::Validation(_)), "{err}");
    }

    #[test]
    fn organization_mismatch_names_the_field() {
        let ca = AuthorityMaterial::generate("kubernetes-ca").unwrap();
        let issued = IdentitySpec::new("kubernetes-admin")
            .organization("wrong-org")
            .usages(&[ExtKeyUsage::ClientAuth]);
        let pair = issue_leaf(&ca, &issued).unwrap();
        let cert = parse_certificate_pem(&pair.cert_pem).unwrap();

        match verify_matches_spec(&cert, &admin_spec()).unwrap_err() {
            PkiError::FieldMismatch {
                field,
                expected,
                actual,
            } => {
                assert_eq!(field, "organization");
                assert_eq!(expected, vec!["system:masters"]);
                assert_eq!(actual, vec!["wrong-org"]);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn usage_and_san_sets_ignore_order() {
        let ca = AuthorityMaterial::generate("etcd-ca").unwrap();
        let spec = IdentitySpec::new("kube-etcd")
            .sans(["localhost", "127.0.0.1", "::1"])
            .usages(&[ExtKeyUsage::ServerAuth, ExtKeyUsage::ClientAuth]);
        let pair = issue_leaf(&ca, &spec).unwrap();
        let cert = parse_certificate_pem(&pair.cert_pem).unwrap();

        let reordered = IdentitySpec::new("kube-etcd")
            .sans(["0:0:0:0:0:0:0:1", "localhost", " 127.0.0.1", "localhost"])
            .usages(&[ExtKeyUsage::ClientAuth, ExtKeyUsage::ServerAuth]);
        verify_matches_spec(&cert, &reordered).unwrap();

        let missing_usage = IdentitySpec::new("kube-etcd")
            .sans(["localhost", "127.0.0.1", "::1"])
            .usages(&[ExtKeyUsage::ServerAuth]);
        assert!(matches!(
            verify_matches_spec(&cert, &missing_usage),
            Err(PkiError::FieldMismatch {
                field: "extended key usage",
                ..
            })
        ));
    }

    #[test]
    fn foreign_key_is_a_key_mismatch() {
        let ca = AuthorityMaterial::generate("kubernetes-ca").unwrap();
        let pair = issue_leaf(&ca, &admin_spec()).unwrap();
        let foreign = generate_private_key(LEAF_KEY_BITS).unwrap();

        let err = validate_signed_leaf(&pair.cert_pem, ca.certificate(), &admin_spec(), &foreign)
            .unwrap_err();
        assert!(matches!(err, PkiError::KeyMismatch));
    }

    #[test]
    fn authority_certificate_is_refused_as_leaf() {
        let ca = AuthorityMaterial::generate("kubernetes-ca").unwrap();
        let spec = IdentitySpec::new("kubernetes-ca");
        let err = validate_signed_leaf(
            &ca.cert_pem().unwrap(),
            ca.certificate(),
            &spec,
            ca.private_key(),
        )
        .unwrap_err();
        assert!(err.to_string().contains("CA certificate"));
    }
}
