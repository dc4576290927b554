// src/signing/auth.rs
use std::collections::BTreeSet;
use tracing::warn;

use super::protocol::{Code, Method, Status};

/// Identity of the caller as established by the channel, i.e. the common
/// name of the client certificate that completed the mTLS handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerIdentity {
    pub common_name: String,
}

impl PeerIdentity {
    pub fn new(common_name: impl Into<String>) -> Self {
        Self {
            common_name: common_name.into(),
        }
    }
}

/// Per-call authorization narrowing on top of transport authentication.
/// An empty list admits any authenticated peer.
#[derive(Debug, Clone, Default)]
pub struct ClientAllowList {
    allowed: BTreeSet<String>,
}

impl ClientAllowList {
    pub fn new<I, S>(common_names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            allowed: common_names
                .into_iter()
                .map(|cn| cn.as_ref().trim().to_string())
                .filter(|cn| !cn.is_empty())
                .collect(),
        }
    }

    /// Comma-separated form used on the command line.
    pub fn from_csv(csv: &str) -> Self {
        Self::new(csv.split(','))
    }

    pub fn is_empty(&self) -> bool {
        self.allowed.is_empty()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.allowed.iter().map(String::as_str)
    }

    pub fn authorize(&self, method: Method, peer: Option<&PeerIdentity>) -> Result<(), Status> {
        if self.allowed.is_empty() {
            return Ok(());
        }
        let peer = match peer {
            Some(peer) if !peer.common_name.is_empty() => peer,
            _ => {
                warn!(method = %method, "call without a peer certificate identity");
                return Err(Status::new(
                    Code::Unauthenticated,
                    "missing peer certificate identity",
                ));
            }
        };
        if self.allowed.contains(&peer.common_name) {
            Ok(())
        } else {
            warn!(method = %method, peer = %peer.common_name, "peer not in allow-list");
            Err(Status::new(
                Code::PermissionDenied,
                format!("client certificate CN {:?} is not allowed", peer.common_name),
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allow_list_admits_only_listed_peers() {
        let list = ClientAllowList::from_csv(" good-client ,,");
        assert!(list
            .authorize(Method::Sign, Some(&PeerIdentity::new("good-client")))
            .is_ok());

        let denied = list
            .authorize(Method::Sign, Some(&PeerIdentity::new("bad-client")))
            .unwrap_err();
        assert_eq!(denied.code, Code::PermissionDenied);

        let missing = list
            .authorize(Method::GetAuthorityCertificate, None)
            .unwrap_err();
        assert_eq!(missing.code, Code::Unauthenticated);
    }

    #[test]
    fn empty_list_admits_everyone() {
        let list = ClientAllowList::from_csv("");
        assert!(list.is_empty());
        assert!(list.authorize(Method::Sign, None).is_ok());
        assert!(list
            .authorize(Method::Sign, Some(&PeerIdentity::new("anyone")))
            .is_ok());
    }
}
