//! Secret-store authentication: federated JWT login for a team-scoped parent
//! credential, then issuance of constrained child credentials from it.

use std::time::Duration;

use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize, Serializer};

use crate::error::{Error, UpstreamFailure};
use crate::oauth::{Profile, UPSTREAM_TIMEOUT, ensure_success, upstream_client};
use crate::teams::TeamTable;
use crate::types::{TeamName, clone_secret};

/// Tag attached to every child credential's metadata.
pub const ISSUER_TAG: &str = "credential-broker";

const UNKNOWN: &str = "unknown";

/// Secret-store connection settings.
#[derive(Debug)]
#[non_exhaustive]
pub struct VaultConfig {
    pub address: String,
    pub jwt_mount: String,
    pub bootstrap_token: SecretString,
}

impl Clone for VaultConfig {
    fn clone(&self) -> Self {
        Self {
            address: self.address.clone(),
            jwt_mount: self.jwt_mount.clone(),
            bootstrap_token: clone_secret(&self.bootstrap_token),
        }
    }
}

impl VaultConfig {
    /// Settings for the store at `address`, logging in through the `jwt`
    /// mount. `bootstrap_token` is only used to probe connectivity.
    #[must_use]
    pub fn new(address: impl Into<String>, bootstrap_token: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            jwt_mount: "jwt".into(),
            bootstrap_token: SecretString::from(bootstrap_token.into()),
        }
    }

    #[must_use]
    pub fn with_jwt_mount(mut self, mount: impl Into<String>) -> Self {
        self.jwt_mount = mount.into();
        self
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/v1/{path}", self.address.trim_end_matches('/'))
    }
}

/// Where an issuance profile gets its policy list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PolicySource {
    /// The team table's policy set (catch-all set for unmapped teams).
    TeamTable,
    /// One policy named by substituting the team into `{team}`.
    Template(String),
}

/// Named constraint set for child credentials.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub struct IssuanceProfile {
    pub name: &'static str,
    pub policies: PolicySource,
    pub ttl: Duration,
    pub max_uses: u32,
    pub no_default_policy: bool,
    pub renewable: bool,
}

impl IssuanceProfile {
    /// Session-based exchange: table policies, 2 hours, 10 uses.
    #[must_use]
    pub fn session() -> Self {
        Self {
            name: "session",
            policies: PolicySource::TeamTable,
            ttl: Duration::from_secs(2 * 60 * 60),
            max_uses: 10,
            no_default_policy: false,
            renewable: false,
        }
    }

    /// Assertion-based exchange: one templated policy, 10 minutes, 50 uses,
    /// no default policy.
    #[must_use]
    pub fn assertion() -> Self {
        Self {
            name: "assertion",
            policies: PolicySource::Template("bazel-{team}".into()),
            ttl: Duration::from_secs(10 * 60),
            max_uses: 50,
            no_default_policy: true,
            renewable: false,
        }
    }

    /// Policies this profile grants `team`.
    #[must_use]
    pub fn policies_for(&self, table: &TeamTable, team: &TeamName) -> Vec<String> {
        match &self.policies {
            PolicySource::TeamTable => table.policies_for(team),
            PolicySource::Template(template) => vec![template.replace("{team}", team.as_str())],
        }
    }
}

/// Build-system context a caller attaches to an exchange.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct BuildContext {
    #[serde(default)]
    pub pipeline: Option<String>,
    #[serde(default)]
    pub repo: Option<String>,
    #[serde(default)]
    pub target: Option<String>,
}

/// Parent credential from federated login. Never leaves the broker.
#[derive(Debug)]
pub struct ParentCredential {
    pub token: SecretString,
    pub entity_id: Option<String>,
}

/// Everything a child credential is issued for.
#[derive(Debug)]
pub struct ChildCredentialRequest<'a> {
    pub profile: &'a Profile,
    pub team: &'a TeamName,
    pub context: &'a BuildContext,
    pub issuance: &'a IssuanceProfile,
    pub policies: Vec<String>,
}

/// Audit metadata returned with a child credential.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[non_exhaustive]
pub struct CredentialMetadata {
    pub team: String,
    pub user: String,
    pub name: String,
    pub pipeline: String,
    pub repo: String,
    pub target: String,
    pub groups: Vec<String>,
    pub source: String,
}

/// A short-lived, use-limited, policy-scoped credential. Returned to the
/// caller once; the broker keeps no copy.
#[derive(Debug, Serialize)]
#[non_exhaustive]
pub struct ConstrainedCredential {
    #[serde(serialize_with = "expose")]
    pub token: SecretString,
    pub ttl: u64,
    pub uses_remaining: u32,
    pub policies: Vec<String>,
    pub metadata: CredentialMetadata,
}

fn expose<S: Serializer>(secret: &SecretString, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(secret.expose_secret())
}

#[derive(Serialize)]
struct LoginRequest<'a> {
    jwt: &'a str,
    role: &'a str,
}

#[derive(Serialize)]
struct TokenCreateRequest<'a> {
    policies: &'a [String],
    ttl: String,
    num_uses: u32,
    renewable: bool,
    no_default_policy: bool,
    display_name: String,
    metadata: TokenCreateMetadata<'a>,
}

#[derive(Serialize)]
struct TokenCreateMetadata<'a> {
    team: &'a str,
    user: &'a str,
    name: &'a str,
    pipeline: &'a str,
    repo: &'a str,
    target: &'a str,
    groups: String,
    source: &'a str,
}

#[derive(Deserialize)]
struct AuthResponse {
    auth: Option<AuthBlock>,
}

#[derive(Deserialize)]
struct AuthBlock {
    client_token: SecretString,
    #[serde(default)]
    entity_id: Option<String>,
    #[serde(default)]
    lease_duration: u64,
    #[serde(default)]
    policies: Option<Vec<String>>,
}

async fn read_auth(
    response: reqwest::Response,
    kind: fn(UpstreamFailure) -> Error,
) -> Result<AuthBlock, Error> {
    let status = response.status().as_u16();
    let body: AuthResponse = response
        .json()
        .await
        .map_err(|e| kind(UpstreamFailure::transport(&e)))?;
    body.auth
        .ok_or_else(|| kind(UpstreamFailure::status(status, "response has no auth block")))
}

/// HTTP client for the secret store.
pub struct SecretStoreClient {
    config: VaultConfig,
    http: reqwest::Client,
}

impl SecretStoreClient {
    /// Create a client whose requests time out after [`UPSTREAM_TIMEOUT`].
    ///
    /// # Errors
    ///
    /// Returns [`Error::ConfigurationMissing`] if the HTTP client cannot be
    /// built.
    pub fn new(config: VaultConfig) -> Result<Self, Error> {
        let http = upstream_client(UPSTREAM_TIMEOUT)?;
        Ok(Self { config, http })
    }

    #[must_use]
    pub fn with_http_client(mut self, client: reqwest::Client) -> Self {
        self.http = client;
        self
    }

    #[must_use]
    pub fn config(&self) -> &VaultConfig {
        &self.config
    }

    /// Check that the bootstrap credential is accepted.
    pub async fn verify_connectivity(&self) -> Result<(), UpstreamFailure> {
        let response = self
            .http
            .get(self.config.endpoint("auth/token/lookup-self"))
            .header("X-Vault-Token", self.config.bootstrap_token.expose_secret())
            .send()
            .await
            .map_err(|e| UpstreamFailure::transport(&e))?;
        if response.status().is_success() {
            return Ok(());
        }
        let status = response.status().as_u16();
        Err(UpstreamFailure::status(
            status,
            response.text().await.unwrap_or_default(),
        ))
    }

    /// Log `assertion` into the JWT auth mount under `role`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::FederatedLoginFailed`] on a non-success response,
    /// a response without an `auth` block, or a transport failure.
    pub async fn login(&self, assertion: &str, role: &str) -> Result<ParentCredential, Error> {
        let url = self
            .config
            .endpoint(&format!("auth/{}/login", self.config.jwt_mount));
        let response = self
            .http
            .post(url)
            .json(&LoginRequest {
                jwt: assertion,
                role,
            })
            .send()
            .await
            .map_err(|e| Error::FederatedLoginFailed(UpstreamFailure::transport(&e)))?;

        let response = ensure_success(response, Error::FederatedLoginFailed).await?;
        let auth = read_auth(response, Error::FederatedLoginFailed).await?;

        Ok(ParentCredential {
            token: auth.client_token,
            entity_id: auth.entity_id.filter(|id| !id.is_empty()),
        })
    }

    /// Create a child credential from `parent` under the request's profile.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ChildCredentialCreationFailed`] on a non-success
    /// response, a response without an `auth` block, or a transport failure.
    pub async fn issue_child_credential(
        &self,
        parent: &SecretString,
        request: ChildCredentialRequest<'_>,
    ) -> Result<ConstrainedCredential, Error> {
        let ChildCredentialRequest {
            profile,
            team,
            context,
            issuance,
            policies,
        } = request;

        let user = profile.email_or_unknown();
        let name = profile.name_or_unknown();
        let pipeline = context.pipeline.as_deref().unwrap_or(UNKNOWN);
        let repo = context.repo.as_deref().unwrap_or(UNKNOWN);
        let target = context.target.as_deref().unwrap_or(UNKNOWN);
        let local_part = user.split('@').next().unwrap_or(user);

        let body = TokenCreateRequest {
            policies: &policies,
            ttl: format!("{}s", issuance.ttl.as_secs()),
            num_uses: issuance.max_uses,
            renewable: issuance.renewable,
            no_default_policy: issuance.no_default_policy,
            display_name: format!("bazel-{team}-{local_part}"),
            metadata: TokenCreateMetadata {
                team: team.as_str(),
                user,
                name,
                pipeline,
                repo,
                target,
                groups: profile.groups.join(","),
                source: ISSUER_TAG,
            },
        };

        let response = self
            .http
            .post(self.config.endpoint("auth/token/create"))
            .header("X-Vault-Token", parent.expose_secret())
            .json(&body)
            .send()
            .await
            .map_err(|e| Error::ChildCredentialCreationFailed(UpstreamFailure::transport(&e)))?;

        let response = ensure_success(response, Error::ChildCredentialCreationFailed).await?;
        let auth = read_auth(response, Error::ChildCredentialCreationFailed).await?;

        tracing::info!(
            %team,
            user,
            profile = issuance.name,
            ttl = auth.lease_duration,
            "Issued child credential"
        );

        let metadata = CredentialMetadata {
            team: team.to_string(),
            user: user.to_owned(),
            name: name.to_owned(),
            pipeline: pipeline.to_owned(),
            repo: repo.to_owned(),
            target: target.to_owned(),
            groups: profile.groups.clone(),
            source: ISSUER_TAG.to_owned(),
        };

        Ok(ConstrainedCredential {
            token: auth.client_token,
            ttl: auth.lease_duration,
            uses_remaining: issuance.max_uses,
            policies: auth.policies.unwrap_or(policies),
            metadata,
        })
    }
}
