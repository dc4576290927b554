// src/cert/issuer.rs
use std::collections::BTreeMap;
use tracing::debug;

use super::ca::AuthorityMaterial;
use super::openssl::{build_name, generate_private_key, private_key_to_pem, sign_leaf, LEAF_KEY_BITS};
use super::types::{IdentitySpec, KeyPair};
use crate::error::{PkiError, Result};

/// Issues a leaf directly from an authority's private key. The key pair is
/// generated here and returned alongside the certificate.
pub fn issue_leaf(authority: &AuthorityMaterial, spec: &IdentitySpec) -> Result<KeyPair> {
    if spec.common_name.trim().is_empty() {
        return Err(PkiError::Validation("identity common name is empty".to_string()));
    }

    let key = generate_private_key(LEAF_KEY_BITS)?;
    let subject = build_name(&spec.common_name, &spec.normalized_organizations())?;
    let cert = sign_leaf(
        &subject,
        &key,
        &spec.split_sans(),
        &spec.normalized_usages(),
        authority.certificate(),
        authority.private_key(),
    )?;

    debug!(
        authority = authority.name(),
        identity = %spec.common_name,
        "issued leaf locally"
    );
    Ok(KeyPair::new(cert.to_pem()?, private_key_to_pem(&key)?))
}

/// Local custody: every authority private key is held in-process.
#[derive(Debug, Default)]
pub struct LocalSigner {
    authorities: BTreeMap<String, AuthorityMaterial>,
}

impl LocalSigner {
    pub fn new(authorities: impl IntoIterator<Item = AuthorityMaterial>) -> Self {
        Self {
            authorities: authorities
                .into_iter()
                .map(|a| (a.name().to_string(), a))
                .collect(),
        }
    }

    pub fn authority(&self, name: &str) -> Result<&AuthorityMaterial> {
        self.authorities
            .get(name)
            .ok_or_else(|| PkiError::Config(format!("no parent authority named {:?}", name)))
    }

    pub fn authorities(&self) -> impl Iterator<Item = &AuthorityMaterial> {
        self.authorities.values()
    }

    pub fn issue_leaf(&self, authority: &str, spec: &IdentitySpec) -> Result<KeyPair> {
        issue_leaf(self.authority(authority)?, spec)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cert::inspect::inspect_certificate;
    use crate::cert::openssl::parse_certificate_pem;
    use crate::cert::types::ExtKeyUsage;

    #[test]
    fn leaf_carries_spec_fields_and_chains_to_its_authority() {
        let ca = AuthorityMaterial::generate("kubernetes-ca").unwrap();
        let other = AuthorityMaterial::generate("etcd-ca").unwrap();
        let spec = IdentitySpec::new("kube-apiserver")
            .sans(["localhost", "127.0.0.1"])
            .usages(&[ExtKeyUsage::ServerAuth]);

        let pair = issue_leaf(&ca, &spec).unwrap();
        assert!(pair.is_complete());

        let cert = parse_certificate_pem(&pair.cert_pem).unwrap();
        assert!(cert.verify(&*ca.certificate().public_key().unwrap()).unwrap());
        assert!(!cert
            .verify(&*other.certificate().public_key().unwrap())
            .unwrap_or(false));

        let fields = inspect_certificate(&cert.to_der().unwrap()).unwrap();
        assert!(!fields.is_ca);
        assert_eq!(fields.dns_names, vec!["localhost"]);
        assert_eq!(fields.ip_addresses, vec!["127.0.0.1"]);
        assert_eq!(fields.ext_key_usages, vec!["serverAuth"]);
    }

    #[test]
    fn missing_parent_authority_is_fatal() {
        let signer = LocalSigner::default();
        let err = signer
            .issue_leaf("kubernetes-ca", &IdentitySpec::new("kubernetes-admin"))
            .unwrap_err();
        assert!(matches!(err, PkiError::Config(_)));
    }
}
