// src/signing/service.rs
use std::collections::BTreeMap;
use std::net::IpAddr;
use tracing::{debug, info, warn};

use super::auth::{ClientAllowList, PeerIdentity};
use super::profile::{SigningProfile, SigningProfiles};
use super::protocol::{Method, SignRequest, Status};
use crate::cert::ca::{AuthorityMaterial, AuthorityStore};
use crate::cert::catalog::AUTHORITY_NAMES;
use crate::cert::inspect::{inspect_csr, RequestFields};
use crate::cert::openssl::{parse_csr_pem, sign_leaf};
use crate::cert::types::{normalize_string_set, SplitSans};
use crate::error::Result;

/// Authority side of the signing protocol.
///
/// Authority material, profiles and the allow-list are fixed at
/// construction. Every call only reads them, so one instance can serve any
/// number of concurrent requests without locking.
#[derive(Debug)]
pub struct SigningService {
    authorities: BTreeMap<String, AuthorityMaterial>,
    profiles: SigningProfiles,
    allow_list: ClientAllowList,
}

impl SigningService {
    pub fn new(
        authorities: impl IntoIterator<Item = AuthorityMaterial>,
        profiles: SigningProfiles,
        allow_list: ClientAllowList,
    ) -> Self {
        Self {
            authorities: authorities
                .into_iter()
                .map(|a| (a.name().to_string(), a))
                .collect(),
            profiles,
            allow_list,
        }
    }

    /// Loads or creates the three kubeadm authorities from `store` and pairs
    /// them with the kubeadm profile table.
    pub fn from_store(store: &AuthorityStore, allow_list: ClientAllowList) -> Result<Self> {
        let authorities = store.ensure_all(&AUTHORITY_NAMES)?;
        info!(
            state_dir = %store.dir().display(),
            authorities = authorities.len(),
            "signing authorities ready"
        );
        Ok(Self::new(authorities, SigningProfiles::kubeadm(), allow_list))
    }

    pub fn allow_list(&self) -> &ClientAllowList {
        &self.allow_list
    }

    /// Entry point for transports: authorization first, then dispatch.
    pub fn handle(
        &self,
        method: Method,
        peer: Option<&PeerIdentity>,
        payload: &str,
    ) -> std::result::Result<String, Status> {
        self.allow_list.authorize(method, peer)?;
        match method {
            Method::GetAuthorityCertificate => self.get_authority_certificate(payload),
            Method::Sign => self.sign(payload),
        }
    }

    pub fn get_authority_certificate(&self, name: &str) -> std::result::Result<String, Status> {
        let name = name.trim();
        let authority = self
            .authorities
            .get(name)
            .ok_or_else(|| Status::not_found(format!("unknown ca {:?}", name)))?;
        let pem = authority
            .cert_pem()
            .map_err(|e| Status::internal(format!("encode ca certificate: {}", e)))?;
        String::from_utf8(pem).map_err(|e| Status::internal(format!("encode ca certificate: {}", e)))
    }

    pub fn sign(&self, payload: &str) -> std::result::Result<String, Status> {
        let request = SignRequest::decode(payload)?;
        let ca_name = request.ca_name.trim();
        let authority = self
            .authorities
            .get(ca_name)
            .ok_or_else(|| Status::invalid_argument(format!("unknown ca {:?}", request.ca_name)))?;

        let csr = parse_csr_pem(request.csr_pem.as_bytes())
            .map_err(|e| Status::invalid_argument(format!("invalid csr: {}", e)))?;
        let public_key = csr
            .public_key()
            .map_err(|e| Status::invalid_argument(format!("invalid csr public key: {}", e)))?;
        if public_key.rsa().is_err() {
            return Err(Status::invalid_argument("csr public key is not RSA"));
        }
        if !csr.verify(&*public_key).unwrap_or(false) {
            return Err(Status::invalid_argument(
                "invalid csr signature: self-signature does not verify",
            ));
        }

        let der = csr
            .to_der()
            .map_err(|e| Status::internal(format!("encode csr: {}", e)))?;
        let fields =
            inspect_csr(&der).map_err(|e| Status::invalid_argument(format!("invalid csr: {}", e)))?;

        let profile = self
            .profiles
            .lookup(ca_name, &fields.common_name)
            .ok_or_else(|| {
                Status::invalid_argument(format!(
                    "unsupported profile: CN {:?} is not allowed for CA {:?}",
                    fields.common_name, ca_name
                ))
            })?;
        if let Err(reason) = validate_csr_against_profile(&fields, profile) {
            warn!(authority = ca_name, identity = %fields.common_name, %reason, "csr rejected");
            return Err(Status::invalid_argument(format!(
                "csr validation failed: {}",
                reason
            )));
        }

        let sans = request_sans(&fields)?;
        let cert = sign_leaf(
            csr.subject_name(),
            &*public_key,
            &sans,
            &profile.ext_key_usages,
            authority.certificate(),
            authority.private_key(),
        )
        .and_then(|cert| Ok(cert.to_pem()?))
        .map_err(|e| Status::internal(format!("sign csr failed: {}", e)))?;

        info!(authority = ca_name, identity = %fields.common_name, "signed csr");
        String::from_utf8(cert).map_err(|e| Status::internal(format!("encode certificate: {}", e)))
    }
}

/// Subject and SAN presence checks. SAN values are not constrained.
pub fn validate_csr_against_profile(
    fields: &RequestFields,
    profile: &SigningProfile,
) -> std::result::Result<(), String> {
    if fields.common_name != profile.common_name {
        return Err(format!(
            "commonName mismatch: got {:?} want {:?}",
            fields.common_name, profile.common_name
        ));
    }
    let organizations = normalize_string_set(&fields.organizations);
    if organizations != profile.organizations {
        return Err(format!(
            "organization mismatch: got {:?} want {:?}",
            organizations, profile.organizations
        ));
    }
    profile
        .san_policy
        .check(fields.san_count())
        .map_err(str::to_string)?;
    debug!(identity = %fields.common_name, sans = fields.san_count(), "csr matches profile");
    Ok(())
}

fn request_sans(fields: &RequestFields) -> std::result::Result<SplitSans, Status> {
    let ip_addresses = fields
        .ip_addresses
        .iter()
        .map(|ip| {
            ip.parse::<IpAddr>()
                .map_err(|e| Status::internal(format!("re-parse IP SAN {:?}: {}", ip, e)))
        })
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(SplitSans {
        dns_names: fields.dns_names.clone(),
        ip_addresses,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cert::catalog::{ETCD_CA, KUBERNETES_CA};
    use crate::cert::inspect::inspect_certificate;
    use crate::cert::openssl::{build_csr, generate_private_key, parse_certificate_pem, LEAF_KEY_BITS};
    use crate::cert::types::{ExtKeyUsage, IdentitySpec};
    use crate::signing::protocol::Code;

    fn service() -> SigningService {
        let authorities = [KUBERNETES_CA, ETCD_CA]
            .into_iter()
            .map(|name| AuthorityMaterial::generate(name).unwrap());
        SigningService::new(
            authorities,
            SigningProfiles::kubeadm(),
            ClientAllowList::default(),
        )
    }

    fn sign_payload(ca: &str, spec: &IdentitySpec) -> String {
        let key = generate_private_key(LEAF_KEY_BITS).unwrap();
        let csr = build_csr(spec, &key).unwrap();
        let pem = String::from_utf8(csr.to_pem().unwrap()).unwrap();
        SignRequest::new(ca, pem).encode().unwrap()
    }

    #[test]
    fn apiserver_gets_server_auth_from_profile() {
        let svc = service();
        let spec = IdentitySpec::new("kube-apiserver").sans(["127.0.0.1", "localhost"]);
        let pem = svc.sign(&sign_payload(KUBERNETES_CA, &spec)).unwrap();

        let cert = parse_certificate_pem(pem.as_bytes()).unwrap();
        let fields = inspect_certificate(&cert.to_der().unwrap()).unwrap();
        assert_eq!(fields.ext_key_usages, vec!["serverAuth"]);
        assert_eq!(fields.dns_names, vec!["localhost"]);
        assert_eq!(fields.ip_addresses, vec!["127.0.0.1"]);
        assert!(!fields.is_ca);
    }

    #[test]
    fn requested_usages_cannot_widen_the_profile() {
        let svc = service();
        let spec = IdentitySpec::new("kubernetes-admin")
            .organization("system:masters")
            .usages(&[ExtKeyUsage::ServerAuth, ExtKeyUsage::ClientAuth]);
        let pem = svc.sign(&sign_payload(KUBERNETES_CA, &spec)).unwrap();
        let cert = parse_certificate_pem(pem.as_bytes()).unwrap();
        let fields = inspect_certificate(&cert.to_der().unwrap()).unwrap();
        assert_eq!(fields.ext_key_usages, vec!["clientAuth"]);
    }

    #[test]
    fn profile_violations_are_invalid_argument() {
        let svc = service();
        let cases = [
            (KUBERNETES_CA, IdentitySpec::new("kube-apiserver")),
            (
                KUBERNETES_CA,
                IdentitySpec::new("kubernetes-admin").organization("wrong-org"),
            ),
            (ETCD_CA, IdentitySpec::new("kubernetes-admin").organization("system:masters")),
            (
                ETCD_CA,
                IdentitySpec::new("kube-etcd-healthcheck-client").sans(["localhost"]),
            ),
        ];
        for (ca, spec) in cases {
            let err = svc.sign(&sign_payload(ca, &spec)).unwrap_err();
            assert_eq!(err.code, Code::InvalidArgument, "{} {}", ca, err);
        }
    }

    #[test]
    fn csr_with_altered_signature_is_refused() {
        let svc = service();
        let spec = IdentitySpec::new("kubernetes-admin").organization("system:masters");
        let key = generate_private_key(LEAF_KEY_BITS).unwrap();
        let mut der = build_csr(&spec, &key).unwrap().to_der().unwrap();
        // The signature bit string is the last field of the request.
        let last = der.len() - 1;
        der[last] ^= 0x01;
        let tampered = openssl::x509::X509Req::from_der(&der).unwrap();
        let pem = String::from_utf8(tampered.to_pem().unwrap()).unwrap();

        let err = svc
            .sign(&SignRequest::new(KUBERNETES_CA, pem).encode().unwrap())
            .unwrap_err();
        assert_eq!(err.code, Code::InvalidArgument);
        assert!(err.message.contains("self-signature does not verify"), "{}", err);
    }

    #[test]
    fn unknown_authorities_and_bad_payloads() {
        let svc = service();
        let spec = IdentitySpec::new("front-proxy-client");
        let err = svc
            .sign(&sign_payload("kubernetes-front-proxy-ca", &spec))
            .unwrap_err();
        assert_eq!(err.code, Code::InvalidArgument);

        assert_eq!(svc.sign("{not-json").unwrap_err().code, Code::InvalidArgument);
        let garbage = SignRequest::new(KUBERNETES_CA, "not a csr").encode().unwrap();
        assert_eq!(svc.sign(&garbage).unwrap_err().code, Code::InvalidArgument);

        assert_eq!(
            svc.get_authority_certificate("nope").unwrap_err().code,
            Code::NotFound
        );
        assert!(svc
            .get_authority_certificate(" etcd-ca ")
            .unwrap()
            .contains("BEGIN CERTIFICATE"));
    }

    #[test]
    fn handle_checks_the_allow_list_first() {
        let svc = SigningService::new(
            [AuthorityMaterial::generate(KUBERNETES_CA).unwrap()],
            SigningProfiles::kubeadm(),
            ClientAllowList::new(["good-client"]),
        );
        let bad = PeerIdentity::new("bad-client");
        let err = svc
            .handle(Method::GetAuthorityCertificate, Some(&bad), KUBERNETES_CA)
            .unwrap_err();
        assert_eq!(err.code, Code::PermissionDenied);

        // Malformed payload still yields PermissionDenied: business logic never ran.
        let err = svc.handle(Method::Sign, Some(&bad), "{not-json").unwrap_err();
        assert_eq!(err.code, Code::PermissionDenied);

        let good = PeerIdentity::new("good-client");
        assert!(svc
            .handle(Method::GetAuthorityCertificate, Some(&good), KUBERNETES_CA)
            .is_ok());
    }
}
