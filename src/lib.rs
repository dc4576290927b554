// src/lib.rs
//! Issuance and validation of the PKI material a kubeadm control plane
//! needs, with authority keys held either in-process or by a remote signer
//! that only ever sees CSRs.

pub mod bootstrap;
pub mod cert;
pub mod config;
pub mod error;
pub mod kubeconfig;
pub mod signing;
pub mod utils;

pub use error::{PkiError, Result};
