// src/cert/ca.rs
use openssl::pkey::{PKey, Private};
use openssl::x509::{X509VerifyResult, X509};
use std::path::{Path, PathBuf};
use std::{fmt, fs};
use tracing::{debug, info};

use super::inspect::inspect_certificate;
use super::openssl::{
    generate_private_key, parse_certificate_pem, parse_private_key_pem, private_key_to_pem,
    rsa_public_keys_match, self_signed_authority, AUTHORITY_KEY_BITS,
};
use super::types::KeyPair;
use crate::error::{PkiError, Result};
use crate::utils::write_with_mode;

const CERT_MODE: u32 = 0o644;
const KEY_MODE: u32 = 0o600;

/// A self-signed root together with its private key.
///
/// Material is immutable after construction; it is only ever created fresh or
/// loaded identically from the store.
#[derive(Clone)]
pub struct AuthorityMaterial {
    name: String,
    certificate: X509,
    private_key: PKey<Private>,
}

impl fmt::Debug for AuthorityMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthorityMaterial")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

impl AuthorityMaterial {
    /// Fresh 4096-bit root whose common name is the authority name.
    pub fn generate(name: &str) -> Result<Self> {
        let private_key = generate_private_key(AUTHORITY_KEY_BITS)?;
        let certificate = self_signed_authority(name, &private_key)?;
        Ok(Self {
            name: name.to_string(),
            certificate,
            private_key,
        })
    }

    /// Loads and checks previously persisted material: the certificate must
    /// be a self-issued CA whose public key belongs to `key_pem`.
    pub fn from_pem(name: &str, cert_pem: &[u8], key_pem: &[u8]) -> Result<Self> {
        let certificate = parse_certificate_pem(cert_pem)?;
        let private_key = parse_private_key_pem(key_pem)?;

        if !inspect_certificate(&certificate.to_der()?)?.is_ca {
            return Err(PkiError::Validation(format!(
                "authority {:?} certificate is not a CA",
                name
            )));
        }
        if certificate.issued(&certificate) != X509VerifyResult::OK
            || !certificate.verify(&*private_key)?
        {
            return Err(PkiError::Validation(format!(
                "authority {:?} certificate is not self-signed",
                name
            )));
        }
        if !rsa_public_keys_match(&*certificate.public_key()?, &*private_key)? {
            return Err(PkiError::Validation(format!(
                "authority {:?} certificate does not match its private key",
                name
            )));
        }

        Ok(Self {
            name: name.to_string(),
            certificate,
            private_key,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn certificate(&self) -> &X509 {
        &self.certificate
    }

    pub fn private_key(&self) -> &PKey<Private> {
        &self.private_key
    }

    pub fn cert_pem(&self) -> Result<Vec<u8>> {
        Ok(self.certificate.to_pem()?)
    }

    /// Certificate only; the key never leaves the store through this path.
    pub fn export(&self) -> Result<KeyPair> {
        Ok(KeyPair::cert_only(self.cert_pem()?))
    }

    /// Certificate and key, for local custody output.
    pub fn export_with_key(&self) -> Result<KeyPair> {
        Ok(KeyPair::new(
            self.cert_pem()?,
            private_key_to_pem(&self.private_key)?,
        ))
    }
}

/// Directory-backed persistence of authority material. The presence of the
/// `.crt`/`.key` files is the only record of whether an authority exists.
#[derive(Debug, Clone)]
pub struct AuthorityStore {
    dir: PathBuf,
}

impl AuthorityStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn cert_path(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{}.crt", file_stem(name)))
    }

    pub fn key_path(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{}.key", file_stem(name)))
    }

    /// Loads the named authority, generating and persisting it on first use.
    ///
    /// Half-present, unreadable or inconsistent material is a configuration
    /// error; it is never regenerated, since a new root would orphan every
    /// leaf already issued under the old one.
    pub fn ensure_authority(&self, name: &str) -> Result<AuthorityMaterial> {
        if name.trim().is_empty() {
            return Err(PkiError::Config("authority name is empty".to_string()));
        }
        let cert_path = self.cert_path(name);
        let key_path = self.key_path(name);

        match (cert_path.exists(), key_path.exists()) {
            (true, true) => {
                let cert_pem = fs::read(&cert_path).map_err(|e| {
                    PkiError::Config(format!("read {}: {}", cert_path.display(), e))
                })?;
                let key_pem = fs::read(&key_path).map_err(|e| {
                    PkiError::Config(format!("read {}: {}", key_path.display(), e))
                })?;
                let material = AuthorityMaterial::from_pem(name, &cert_pem, &key_pem).map_err(
                    |e| {
                        PkiError::Config(format!(
                            "load authority {:?} from {}: {}",
                            name,
                            self.dir.display(),
                            e
                        ))
                    },
                )?;
                debug!(authority = name, path = %cert_path.display(), "loaded authority");
                Ok(material)
            }
            (false, false) => {
                fs::create_dir_all(&self.dir).map_err(|e| {
                    PkiError::Config(format!("create state dir {}: {}", self.dir.display(), e))
                })?;
                let material = AuthorityMaterial::generate(name)?;
                write_with_mode(&cert_path, &material.cert_pem()?, CERT_MODE)?;
                write_with_mode(
                    &key_path,
                    &private_key_to_pem(material.private_key())?,
                    KEY_MODE,
                )?;
                info!(authority = name, path = %cert_path.display(), "created authority");
                Ok(material)
            }
            (cert_present, _) => {
                let (present, missing) = if cert_present {
                    (&cert_path, &key_path)
                } else {
                    (&key_path, &cert_path)
                };
                Err(PkiError::Config(format!(
                    "authority {:?} is half-initialized: {} exists but {} is missing",
                    name,
                    present.display(),
                    missing.display()
                )))
            }
        }
    }

    /// `ensure_authority` for each name, in order.
    pub fn ensure_all<S: AsRef<str>>(&self, names: &[S]) -> Result<Vec<AuthorityMaterial>> {
        names
            .iter()
            .map(|name| self.ensure_authority(name.as_ref()))
            .collect()
    }
}

fn file_stem(name: &str) -> String {
    name.trim().replace(' ', "-")
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn reload_is_byte_identical() {
        let dir = TempDir::new().unwrap();
        let store = AuthorityStore::new(dir.path());

        let first = store.ensure_authority("etcd-ca").unwrap();
        let second = store.ensure_authority("etcd-ca").unwrap();
        assert_eq!(first.cert_pem().unwrap(), second.cert_pem().unwrap());
        assert_eq!(
            first.export_with_key().unwrap(),
            second.export_with_key().unwrap()
        );
    }

    #[cfg(unix)]
    #[test]
    fn persisted_files_have_restricted_modes() {
        use std::os::unix::fs::PermissionsExt;
        let dir = TempDir::new().unwrap();
        let store = AuthorityStore::new(dir.path().join("state"));
        store.ensure_authority("kubernetes ca").unwrap();

        let cert = fs::metadata(dir.path().join("state/kubernetes-ca.crt")).unwrap();
        let key = fs::metadata(dir.path().join("state/kubernetes-ca.key")).unwrap();
        assert_eq!(cert.permissions().mode() & 0o777, 0o644);
        assert_eq!(key.permissions().mode() & 0o777, 0o600);
    }

    #[test]
    fn half_present_material_is_fatal() {
        let dir = TempDir::new().unwrap();
        let store = AuthorityStore::new(dir.path());
        store.ensure_authority("kubernetes-ca").unwrap();
        fs::remove_file(store.key_path("kubernetes-ca")).unwrap();

        let err = store.ensure_authority("kubernetes-ca").unwrap_err();
        assert!(matches!(err, PkiError::Config(_)), "{err}");
        assert!(!store.key_path("kubernetes-ca").exists());
    }

    #[test]
    fn corrupt_material_is_not_regenerated() {
        let dir = TempDir::new().unwrap();
        let store = AuthorityStore::new(dir.path());
        store.ensure_authority("kubernetes-front-proxy-ca").unwrap();
        fs::write(store.cert_path("kubernetes-front-proxy-ca"), b"garbage").unwrap();

        let err = store
            .ensure_authority("kubernetes-front-proxy-ca")
            .unwrap_err();
        assert!(matches!(err, PkiError::Config(_)), "{err}");
        assert_eq!(
            fs::read(store.cert_path("kubernetes-front-proxy-ca")).unwrap(),
            b"garbage"
        );
    }

    #[test]
    fn mismatched_key_is_rejected() {
        let dir = TempDir::new().unwrap();
        let store = AuthorityStore::new(dir.path());
        store.ensure_authority("a").unwrap();
        store.ensure_authority("b").unwrap();
        fs::copy(store.key_path("b"), store.key_path("a")).unwrap();

        assert!(matches!(
            store.ensure_authority("a"),
            Err(PkiError::Config(_))
        ));
    }

    #[test]
    fn export_carries_no_key() {
        let ca = AuthorityMaterial::generate("kubernetes-ca").unwrap();
        let exported = ca.export().unwrap();
        assert!(exported.key_pem.is_none());
        assert!(!exported.cert_pem.is_empty());
    }
}
