// src/cert/mod.rs
pub mod ca;
pub mod catalog;
pub mod inspect;
pub mod issuer;
pub mod openssl;
pub mod service_account;
pub mod types;
pub mod verification;

pub use ca::{AuthorityMaterial, AuthorityStore};
pub use catalog::{IdentityCatalog, LeafIdentity, AUTHORITY_NAMES, ETCD_CA, FRONT_PROXY_CA, KUBERNETES_CA};
pub use issuer::{issue_leaf, LocalSigner};
pub use types::{ExtKeyUsage, IdentitySpec, KeyPair};
