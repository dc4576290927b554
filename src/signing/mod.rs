// src/signing/mod.rs
pub mod auth;
pub mod client;
pub mod https;
pub mod profile;
pub mod protocol;
pub mod service;

pub use auth::{ClientAllowList, PeerIdentity};
pub use client::{InProcessTransport, RemoteAuthority, RemoteSigningClient, SignerTransport};
pub use https::{ClientTlsMaterial, HttpsTransport, ServerTlsMaterial, SignerServer};
pub use profile::{SanPolicy, SigningProfile, SigningProfiles};
pub use protocol::{Code, Method, SignRequest, Status};
pub use service::SigningService;
