// src/cert/service_account.rs
use tracing::{info, warn};

use super::openssl::{generate_private_key, private_key_to_pem, public_key_to_pem, LEAF_KEY_BITS};
use super::types::KeyPair;
use super::verification::public_key_pair_matches;
use crate::error::Result;

/// Fresh service-account signing pair: SPKI public key PEM in the cert slot,
/// PKCS#1 private key PEM in the key slot. No certificate is involved.
pub fn generate_service_account_key() -> Result<KeyPair> {
    let key = generate_private_key(LEAF_KEY_BITS)?;
    Ok(KeyPair::new(public_key_to_pem(&*key)?, private_key_to_pem(&key)?))
}

/// Carries over `previous` when both halves are present and belong together,
/// otherwise generates a new pair. Returns the pair and whether it was reused.
pub fn reuse_or_generate(previous: Option<&KeyPair>) -> Result<(KeyPair, bool)> {
    match previous {
        Some(pair) if pair.is_complete() => {
            match public_key_pair_matches(&pair.cert_pem, pair.key_bytes()) {
                Ok(()) => {
                    info!("reusing existing service-account key pair");
                    return Ok((pair.clone(), true));
                }
                Err(e) => warn!(
                    error = %e,
                    "existing service-account key pair is unusable; generating a new one"
                ),
            }
        }
        Some(_) => warn!("existing service-account key pair is incomplete; generating a new one"),
        None => {}
    }
    Ok((generate_service_account_key()?, false))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_pair_matches_itself() {
        let pair = generate_service_account_key().unwrap();
        let text = String::from_utf8(pair.cert_pem.clone()).unwrap();
        assert!(text.contains("BEGIN PUBLIC KEY"));
        public_key_pair_matches(&pair.cert_pem, pair.key_bytes()).unwrap();
    }

    #[test]
    fn valid_previous_pair_is_reused() {
        let previous = generate_service_account_key().unwrap();
        let (pair, reused) = reuse_or_generate(Some(&previous)).unwrap();
        assert!(reused);
        assert_eq!(pair, previous);
    }

    #[test]
    fn mismatched_or_partial_pairs_are_replaced() {
        let a = generate_service_account_key().unwrap();
        let b = generate_service_account_key().unwrap();
        let crossed = KeyPair::new(a.cert_pem.clone(), b.key_bytes().to_vec());
        let (pair, reused) = reuse_or_generate(Some(&crossed)).unwrap();
        assert!(!reused);
        assert_ne!(pair, crossed);

        let (_, reused) = reuse_or_generate(Some(&KeyPair::cert_only(a.cert_pem))).unwrap();
        assert!(!reused);
        let (_, reused) = reuse_or_generate(None).unwrap();
        assert!(!reused);
    }
}
