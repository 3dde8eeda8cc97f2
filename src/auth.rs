//! Login against the vendor's hosted identity provider, and exchange of the
//! resulting ID token for temporary cloud credentials.

mod cache;
mod srp;

use std::collections::HashMap;

use anyhow::{Context as _, Result, bail, ensure};
use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::{DateTime, Duration, Utc};
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use tracing::{debug, info, warn};

pub use cache::{CachedTokens, TokenCache};
pub use srp::{PasswordClaim, PasswordVerifier, SrpClient};

const IDENTITY_PROVIDER_TARGET: &str = "AWSCognitoIdentityProviderService";
const IDENTITY_TARGET: &str = "AWSCognitoIdentityService";
const CONTENT_TYPE: &str = "application/x-amz-json-1.1";
const PASSWORD_VERIFIER: &str = "PASSWORD_VERIFIER";

/// Cached ID tokens this close to expiry are refreshed instead of used.
const EXPIRY_MARGIN_SECS: i64 = 60;

#[derive(Debug, Clone)]
pub struct CognitoConfig {
    pub region: String,
    pub user_pool_id: String,
    pub client_id: String,
    pub identity_pool_id: String,
}

impl CognitoConfig {
    pub fn mysa() -> Self {
        Self {
            region: "us-east-1".to_owned(),
            user_pool_id: "us-east-1_GUFWfhI7g".to_owned(),
            client_id: "19efs8tgqe942atbqmot5m36t3".to_owned(),
            identity_pool_id: "us-east-1:ebd95d52-9995-45da-b059-56b865a18379".to_owned(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Tokens {
    pub id_token: String,
    /// Not kept in the token cache.
    #[serde(default)]
    pub access_token: Option<String>,
    /// Only returned by password logins.
    pub refresh_token: Option<String>,
    pub token_type: String,
    #[serde(default)]
    pub expires_in: Option<u64>,
}

impl Tokens {
    pub fn from_cache(cached: CachedTokens) -> Self {
        Self {
            id_token: cached.id_token,
            access_token: None,
            refresh_token: Some(cached.refresh_token),
            token_type: "Bearer".to_owned(),
            expires_in: None,
        }
    }

    /// Claims of the ID token. The signature is not verified.
    pub fn claims(&self) -> Result<Map<String, Value>> {
        let payload = self
            .id_token
            .split('.')
            .nth(1)
            .context("ID token is not a JWT")?;
        let decoded = URL_SAFE_NO_PAD
            .decode(payload.trim_end_matches('='))
            .context("ID token payload is not base64url")?;
        serde_json::from_slice(&decoded).context("ID token payload is not a JSON object")
    }

    pub fn username(&self) -> Result<String> {
        self.claims()?
            .get("cognito:username")
            .and_then(Value::as_str)
            .map(str::to_owned)
            .context("ID token has no cognito:username")
    }

    /// Whether the token belongs to `user`, by username or by email.
    pub fn is_for(&self, user: &str) -> Result<bool> {
        let claims = self.claims()?;
        Ok(["cognito:username", "email"]
            .iter()
            .any(|claim| claims.get(*claim).and_then(Value::as_str) == Some(user)))
    }

    pub fn expires_at(&self) -> Result<DateTime<Utc>> {
        self.claims()?
            .get("exp")
            .and_then(Value::as_i64)
            .and_then(|exp| DateTime::from_timestamp(exp, 0))
            .context("ID token has no valid exp claim")
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> Result<bool> {
        Ok(self.expires_at()? <= now + Duration::seconds(EXPIRY_MARGIN_SECS))
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct AwsCredentials {
    #[serde(rename = "AccessKeyId")]
    pub access_key: String,
    #[serde(rename = "SecretKey")]
    pub secret_key: String,
    #[serde(rename = "SessionToken")]
    pub session_token: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct AuthResponse {
    authentication_result: Option<Tokens>,
    challenge_name: Option<String>,
    #[serde(default)]
    challenge_parameters: HashMap<String, String>,
    session: Option<String>,
}

impl AuthResponse {
    fn into_tokens(self) -> Result<Tokens> {
        match (self.authentication_result, self.challenge_name) {
            (Some(tokens), _) => {
                ensure!(
                    tokens.token_type == "Bearer",
                    "unexpected token type {}",
                    tokens.token_type
                );
                Ok(tokens)
            }
            (None, Some(challenge)) => bail!("login requires unsupported challenge {challenge}"),
            (None, None) => bail!("login returned neither tokens nor a challenge"),
        }
    }

    fn password_verifier(&self) -> Result<PasswordVerifier<'_>> {
        match self.challenge_name.as_deref() {
            Some(PASSWORD_VERIFIER) => {}
            Some(other) => bail!("login requires unsupported challenge {other}"),
            None => bail!("password login returned no {PASSWORD_VERIFIER} challenge"),
        }
        Ok(PasswordVerifier {
            user_id_for_srp: self.challenge_parameter("USER_ID_FOR_SRP")?,
            salt: self.challenge_parameter("SALT")?,
            srp_b: self.challenge_parameter("SRP_B")?,
            secret_block: self.challenge_parameter("SECRET_BLOCK")?,
        })
    }

    fn challenge_parameter(&self, key: &str) -> Result<&str> {
        self.challenge_parameters
            .get(key)
            .map(String::as_str)
            .with_context(|| format!("{PASSWORD_VERIFIER} challenge has no {key}"))
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct GetIdResponse {
    identity_id: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct GetCredentialsResponse {
    credentials: AwsCredentials,
}

#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct InitiateAuth<'a> {
    auth_flow: &'a str,
    client_id: &'a str,
    auth_parameters: HashMap<&'a str, &'a str>,
}

#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct RespondToAuthChallenge<'a> {
    challenge_name: &'a str,
    client_id: &'a str,
    challenge_responses: HashMap<&'a str, &'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    session: Option<&'a str>,
}

pub struct CognitoClient {
    client: Client,
    config: CognitoConfig,
}

impl CognitoClient {
    pub fn new(config: CognitoConfig) -> Result<Self> {
        let client = Client::builder()
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self { client, config })
    }

    /// Password login over SRP, so the password itself never leaves this
    /// process.
    pub async fn authenticate(&self, username: &str, password: &str) -> Result<Tokens> {
        let srp = SrpClient::new();
        let srp_a = srp.public_a();
        let request = InitiateAuth {
            auth_flow: "USER_SRP_AUTH",
            client_id: &self.config.client_id,
            auth_parameters: HashMap::from([("USERNAME", username), ("SRP_A", srp_a.as_str())]),
        };
        let challenge = self.initiate_auth(&request).await?;

        let verifier = challenge.password_verifier()?;
        let claim = srp.password_claim(&self.config.user_pool_id, password, &verifier, Utc::now())?;
        let response = RespondToAuthChallenge {
            challenge_name: PASSWORD_VERIFIER,
            client_id: &self.config.client_id,
            challenge_responses: HashMap::from([
                ("USERNAME", challenge.challenge_parameter("USERNAME")?),
                ("TIMESTAMP", claim.timestamp.as_str()),
                ("PASSWORD_CLAIM_SECRET_BLOCK", verifier.secret_block),
                ("PASSWORD_CLAIM_SIGNATURE", claim.signature.as_str()),
            ]),
            session: challenge.session.as_deref(),
        };
        let tokens = self
            .identity_provider("RespondToAuthChallenge", &response)
            .await
            .context("password verification failed")?
            .into_tokens()?;

        info!(username, "authenticated");
        Ok(tokens)
    }

    /// Trades a refresh token for fresh ID and access tokens. The response
    /// carries no new refresh token, so the one passed in is kept.
    pub async fn refresh(&self, refresh_token: &str) -> Result<Tokens> {
        let request = InitiateAuth {
            auth_flow: "REFRESH_TOKEN_AUTH",
            client_id: &self.config.client_id,
            auth_parameters: HashMap::from([("REFRESH_TOKEN", refresh_token)]),
        };
        let mut tokens = self.initiate_auth(&request).await?.into_tokens()?;
        tokens.refresh_token.get_or_insert_with(|| refresh_token.to_owned());
        Ok(tokens)
    }

    /// Uses the refresh token when there is one, otherwise the password.
    pub async fn sign_in(
        &self,
        username: Option<&str>,
        password: Option<&str>,
        refresh_token: Option<&str>,
    ) -> Result<Tokens> {
        match (refresh_token, username, password) {
            (Some(token), _, _) => self.refresh(token).await,
            (None, Some(username), Some(password)) => self.authenticate(username, password).await,
            (None, None, _) => bail!("a username (or refresh token) is required"),
            (None, Some(_), None) => bail!("a password (or refresh token) is required"),
        }
    }

    /// Like [`CognitoClient::sign_in`], but first tries the tokens remembered
    /// in `cache`, and remembers whatever tokens it ends up with. A cache
    /// that cannot be used only costs a fresh login.
    pub async fn sign_in_cached(
        &self,
        cache: &TokenCache,
        username: Option<&str>,
        password: Option<&str>,
        refresh_token: Option<&str>,
    ) -> Result<Tokens> {
        if refresh_token.is_none() {
            match self.resume(cache, username).await {
                Ok(Some(tokens)) => return Ok(tokens),
                Ok(None) => info!(path = %cache.path().display(), "no cached login found"),
                Err(e) => warn!("cached login unusable: {e:#}"),
            }
        }

        let tokens = self.sign_in(username, password, refresh_token).await?;
        let user = match username {
            Some(user) => Ok(user.to_owned()),
            None => tokens.username(),
        };
        match user {
            Ok(user) => self.remember(cache, &user, &tokens).await,
            Err(e) => warn!("not saving login: {e:#}"),
        }
        Ok(tokens)
    }

    /// Reuses cached tokens, refreshing them when the ID token has expired.
    async fn resume(&self, cache: &TokenCache, username: Option<&str>) -> Result<Option<Tokens>> {
        let Some((user, cached)) = cache.load(username).await? else {
            return Ok(None);
        };

        let mut tokens = Tokens::from_cache(cached);
        if tokens.is_expired(Utc::now())? {
            let refresh_token = tokens.refresh_token.take().unwrap_or_default();
            tokens = self
                .refresh(&refresh_token)
                .await
                .context("new login needed, the refresh token was rejected")?;
            debug!(%user, "refreshed cached ID token");
            self.remember(cache, &user, &tokens).await;
        } else {
            debug!(%user, "using unexpired cached ID token");
        }

        if !tokens.is_for(&user)? {
            bail!("expected user {user} but token is for user {}", tokens.username()?);
        }
        Ok(Some(tokens))
    }

    async fn remember(&self, cache: &TokenCache, user: &str, tokens: &Tokens) {
        let Some(refresh_token) = &tokens.refresh_token else {
            return;
        };
        let cached = CachedTokens {
            id_token: tokens.id_token.clone(),
            refresh_token: refresh_token.clone(),
        };
        match cache.store(user, &cached).await {
            Ok(()) => info!(%user, path = %cache.path().display(), "saved login"),
            Err(e) => warn!(%user, "failed to save login: {e:#}"),
        }
    }

    pub async fn get_credentials(&self, tokens: &Tokens) -> Result<AwsCredentials> {
        let issuer = tokens
            .claims()?
            .get("iss")
            .and_then(Value::as_str)
            .map(|iss| iss.trim_start_matches("https://").to_owned())
            .context("ID token has no iss claim")?;
        let logins = json!({ issuer: tokens.id_token });

        let endpoint = format!("https://cognito-identity.{}.amazonaws.com/", self.config.region);
        let id: GetIdResponse = self
            .call(
                &endpoint,
                &format!("{IDENTITY_TARGET}.GetId"),
                &json!({"IdentityPoolId": self.config.identity_pool_id, "Logins": logins}),
            )
            .await
            .context("failed to get identity id")?;
        debug!(identity_id = %id.identity_id, "resolved identity");

        let credentials: GetCredentialsResponse = self
            .call(
                &endpoint,
                &format!("{IDENTITY_TARGET}.GetCredentialsForIdentity"),
                &json!({"IdentityId": id.identity_id, "Logins": logins}),
            )
            .await
            .context("failed to get credentials for identity")?;

        Ok(credentials.credentials)
    }

    async fn initiate_auth(&self, request: &InitiateAuth<'_>) -> Result<AuthResponse> {
        self.identity_provider("InitiateAuth", request)
            .await
            .with_context(|| format!("{} login failed", request.auth_flow))
    }

    async fn identity_provider<B: Serialize>(
        &self,
        action: &str,
        body: &B,
    ) -> Result<AuthResponse> {
        let endpoint = format!("https://cognito-idp.{}.amazonaws.com/", self.config.region);
        self.call(&endpoint, &format!("{IDENTITY_PROVIDER_TARGET}.{action}"), body)
            .await
    }

    async fn call<B: Serialize + ?Sized, T: DeserializeOwned>(
        &self,
        endpoint: &str,
        target: &str,
        body: &B,
    ) -> Result<T> {
        let response = self
            .client
            .post(endpoint)
            .header("X-Amz-Target", target)
            .header(reqwest::header::CONTENT_TYPE, CONTENT_TYPE)
            .body(serde_json::to_vec(body).context("failed to encode request")?)
            .send()
            .await
            .with_context(|| format!("failed to send {target}"))?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            bail!("{target} returned {status}: {detail}");
        }

        response
            .json()
            .await
            .with_context(|| format!("failed to parse {target} response"))
    }
}
