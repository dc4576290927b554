// cert/types.rs
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::net::IpAddr;

/// Extended key usages the catalog issues. Anything else is out of scope.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "camelCase")]
pub enum ExtKeyUsage {
    ServerAuth,
    ClientAuth,
}

impl fmt::Display for ExtKeyUsage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExtKeyUsage::ServerAuth => write!(f, "serverAuth"),
            ExtKeyUsage::ClientAuth => write!(f, "clientAuth"),
        }
    }
}

/// What an issued certificate must contain.
///
/// Organizations, SANs and usages are sets: order and duplicates carry no
/// meaning and are normalized away whenever two specs or a spec and a
/// certificate are compared.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IdentitySpec {
    pub common_name: String,
    pub organizations: Vec<String>,
    pub subject_alt_names: Vec<String>,
    pub ext_key_usages: Vec<ExtKeyUsage>,
}

impl IdentitySpec {
    pub fn new(common_name: impl Into<String>) -> Self {
        Self {
            common_name: common_name.into(),
            organizations: Vec::new(),
            subject_alt_names: Vec::new(),
            ext_key_usages: Vec::new(),
        }
    }

    pub fn organization(mut self, org: impl Into<String>) -> Self {
        self.organizations.push(org.into());
        self
    }

    pub fn sans<I, S>(mut self, sans: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.subject_alt_names.extend(sans.into_iter().map(Into::into));
        self
    }

    pub fn usages(mut self, usages: &[ExtKeyUsage]) -> Self {
        self.ext_key_usages.extend_from_slice(usages);
        self
    }

    /// SANs split into DNS names and IP addresses.
    pub fn split_sans(&self) -> SplitSans {
        split_sans(&self.subject_alt_names)
    }

    pub fn normalized_organizations(&self) -> Vec<String> {
        normalize_string_set(&self.organizations)
    }

    pub fn normalized_usages(&self) -> Vec<ExtKeyUsage> {
        normalize_usages(&self.ext_key_usages)
    }
}

/// PEM material produced by an issuance. Authority exports carry no key.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KeyPair {
    pub cert_pem: Vec<u8>,
    pub key_pem: Option<Vec<u8>>,
}

impl KeyPair {
    pub fn new(cert_pem: Vec<u8>, key_pem: Vec<u8>) -> Self {
        Self {
            cert_pem,
            key_pem: Some(key_pem),
        }
    }

    pub fn cert_only(cert_pem: Vec<u8>) -> Self {
        Self {
            cert_pem,
            key_pem: None,
        }
    }

    /// Key bytes, or an empty slice for cert-only pairs.
    pub fn key_bytes(&self) -> &[u8] {
        self.key_pem.as_deref().unwrap_or_default()
    }

    /// Both halves present and non-empty.
    pub fn is_complete(&self) -> bool {
        !self.cert_pem.is_empty() && !self.key_bytes().is_empty()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SplitSans {
    pub dns_names: Vec<String>,
    pub ip_addresses: Vec<IpAddr>,
}

impl SplitSans {
    pub fn len(&self) -> usize {
        self.dns_names.len() + self.ip_addresses.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// IPs in canonical text form, the only form they are ever compared in.
    pub fn ip_strings(&self) -> Vec<String> {
        self.ip_addresses.iter().map(IpAddr::to_string).collect()
    }
}

/// Deterministic SAN split: IP literal first, DNS name otherwise. Blank and
/// repeated entries are dropped, first-seen order is kept.
pub fn split_sans<S: AsRef<str>>(sans: &[S]) -> SplitSans {
    let mut out = SplitSans::default();
    let mut seen = BTreeSet::new();
    for san in sans {
        let san = san.as_ref().trim();
        if san.is_empty() || !seen.insert(san.to_string()) {
            continue;
        }
        match san.parse::<IpAddr>() {
            Ok(ip) => out.ip_addresses.push(ip),
            Err(_) => out.dns_names.push(san.to_string()),
        }
    }
    out
}

/// Trimmed, blank-free, deduplicated and sorted. Case is kept as-is.
pub fn normalize_string_set<S: AsRef<str>>(values: &[S]) -> Vec<String> {
    values
        .iter()
        .map(|v| v.as_ref().trim())
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

pub fn normalize_usages(usages: &[ExtKeyUsage]) -> Vec<ExtKeyUsage> {
    usages
        .iter()
        .copied()
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

pub fn equal_string_sets<A: AsRef<str>, B: AsRef<str>>(a: &[A], b: &[B]) -> bool {
    normalize_string_set(a) == normalize_string_set(b)
}
