// src/signing/profile.rs
use std::collections::BTreeMap;

use crate::cert::catalog::{ETCD_CA, FRONT_PROXY_CA, KUBERNETES_CA, SYSTEM_MASTERS};
use crate::cert::types::{normalize_string_set, normalize_usages, ExtKeyUsage};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SanPolicy {
    Forbidden,
    Optional,
    Required,
}

impl SanPolicy {
    /// Only presence is constrained; SAN values are the requester's choice.
    pub fn check(self, san_count: usize) -> Result<(), &'static str> {
        match (self, san_count) {
            (SanPolicy::Forbidden, n) if n > 0 => Err("SANs are not allowed for this profile"),
            (SanPolicy::Required, 0) => Err("at least one SAN is required"),
            _ => Ok(()),
        }
    }
}

/// What the signer is willing to issue for one (authority, commonName).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SigningProfile {
    pub authority: String,
    pub common_name: String,
    /// Normalized; compared as an exact set.
    pub organizations: Vec<String>,
    /// Normalized; written into the certificate regardless of the CSR.
    pub ext_key_usages: Vec<ExtKeyUsage>,
    pub san_policy: SanPolicy,
}

/// Immutable lookup table, built once at startup and only read afterwards.
#[derive(Debug, Clone, Default)]
pub struct SigningProfiles {
    by_key: BTreeMap<(String, String), SigningProfile>,
}

impl SigningProfiles {
    pub fn from_profiles(profiles: impl IntoIterator<Item = SigningProfile>) -> Self {
        Self {
            by_key: profiles
                .into_iter()
                .map(|p| ((p.authority.clone(), p.common_name.clone()), p))
                .collect(),
        }
    }

    /// The kubeadm control-plane table.
    pub fn kubeadm() -> Self {
        use ExtKeyUsage::{ClientAuth, ServerAuth};
        use SanPolicy::{Forbidden, Required};

        let table: [(&str, &str, &[&str], &[ExtKeyUsage], SanPolicy); 11] = [
            (KUBERNETES_CA, "kube-apiserver", &[], &[ServerAuth], Required),
            (
                KUBERNETES_CA,
                "kube-apiserver-kubelet-client",
                &[SYSTEM_MASTERS],
                &[ClientAuth],
                Forbidden,
            ),
            (KUBERNETES_CA, "kubernetes-admin", &[SYSTEM_MASTERS], &[ClientAuth], Forbidden),
            (
                KUBERNETES_CA,
                "kubernetes-super-admin",
                &[SYSTEM_MASTERS],
                &[ClientAuth],
                Forbidden,
            ),
            (
                KUBERNETES_CA,
                "system:kube-controller-manager",
                &["system:kube-controller-manager"],
                &[ClientAuth],
                Forbidden,
            ),
            (
                KUBERNETES_CA,
                "system:kube-scheduler",
                &["system:kube-scheduler"],
                &[ClientAuth],
                Forbidden,
            ),
            (FRONT_PROXY_CA, "front-proxy-client", &[], &[ClientAuth], Forbidden),
            (
                ETCD_CA,
                "kube-apiserver-etcd-client",
                &[SYSTEM_MASTERS],
                &[ClientAuth],
                Forbidden,
            ),
            (ETCD_CA, "kube-etcd", &[], &[ServerAuth, ClientAuth], Required),
            (ETCD_CA, "kube-etcd-peer", &[], &[ServerAuth, ClientAuth], Required),
            (ETCD_CA, "kube-etcd-healthcheck-client", &[], &[ClientAuth], Forbidden),
        ];

        Self::from_profiles(table.iter().map(|&(authority, cn, orgs, usages, sans)| {
            SigningProfile {
                authority: authority.to_string(),
                common_name: cn.to_string(),
                organizations: normalize_string_set(orgs),
                ext_key_usages: normalize_usages(usages),
                san_policy: sans,
            }
        }))
    }

    /// Exact lookup. No wildcard and no fallback profile.
    pub fn lookup(&self, authority: &str, common_name: &str) -> Option<&SigningProfile> {
        self.by_key
            .get(&(authority.to_string(), common_name.to_string()))
    }

    pub fn len(&self) -> usize {
        self.by_key.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_key.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cert::catalog::IdentityCatalog;

    #[test]
    fn lookup_is_exact() {
        let profiles = SigningProfiles::kubeadm();
        assert!(profiles.lookup(KUBERNETES_CA, "kube-apiserver").is_some());
        assert!(profiles.lookup(ETCD_CA, "kube-apiserver").is_none());
        assert!(profiles.lookup(KUBERNETES_CA, "Kube-Apiserver").is_none());
        assert!(profiles.lookup("unknown-ca", "kube-apiserver").is_none());
    }

    #[test]
    fn san_policy_counts() {
        assert!(SanPolicy::Forbidden.check(0).is_ok());
        assert!(SanPolicy::Forbidden.check(1).is_err());
        assert!(SanPolicy::Required.check(0).is_err());
        assert!(SanPolicy::Required.check(3).is_ok());
        assert!(SanPolicy::Optional.check(0).is_ok());
        assert!(SanPolicy::Optional.check(9).is_ok());
    }

    #[test]
    fn profiles_agree_with_the_requester_catalog() {
        let profiles = SigningProfiles::kubeadm();
        let catalog = IdentityCatalog::kubeadm(&[], &[]);
        assert_eq!(profiles.len(), catalog.entries().len());
        for entry in catalog.entries() {
            let profile = profiles
                .lookup(entry.authority, &entry.spec.common_name)
                .unwrap_or_else(|| panic!("no profile for {}", entry.identity));
            assert_eq!(profile.ext_key_usages, entry.spec.normalized_usages());
            assert_eq!(profile.organizations, entry.spec.normalized_organizations());
            assert!(profile
                .san_policy
                .check(entry.spec.split_sans().len())
                .is_ok());
        }
    }
}
