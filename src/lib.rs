#![doc = include_str!("../README.md")]

pub mod broker;
pub mod config;
pub mod error;
pub mod oauth;
pub mod pkce;
pub mod server;
pub mod session;
pub mod teams;
pub mod token;
pub mod types;
pub mod vault;
pub mod well_known;

// Re-exports for convenient access
pub use broker::{Broker, CallbackOutcome, CallbackParams, FlowState, PendingGrant, SessionGrant};
pub use config::BrokerConfig;
pub use error::{Error, UpstreamFailure};
pub use oauth::{IdpClient, OAuthConfig, Profile, TokenResponse};
pub use pkce::{PkceFlowManager, generate_code_challenge, generate_code_verifier, generate_state};
pub use session::{MemorySessionStore, SessionStore, spawn_reaper};
pub use teams::{TeamAssignment, TeamMapping, TeamTable};
pub use token::{AssertionClaims, AssertionMinter, AssertionVerifier, Audience, SigningPosture};
pub use types::{FlowOrigin, KeyId, SelectionId, SessionId, TeamName};
pub use vault::{
    BuildContext, ConstrainedCredential, IssuanceProfile, SecretStoreClient, VaultConfig,
};
pub use well_known::{Jwk, JwkSet};
