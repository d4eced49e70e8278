//! Bearer-token authentication for request handlers.
//!
//! Tokens are HS256 JWTs signed with `auth.jwt_secret`. Wrapping a handler
//! with [`authenticated`] rejects requests without a valid token as 401 and
//! exposes the verified [`Claims`] through [`Context::claims`].

use jsonwebtoken::{
    decode, encode, get_current_timestamp, Algorithm, DecodingKey, EncodingKey, Header, Validation,
};
use serde::{Deserialize, Serialize};

use crate::config::AuthConfig;
use crate::error::{Error, Result};
use crate::handler::{Context, Handler, HandlerError, HandlerFuture};

const BEARER: &str = "Bearer ";
const DEFAULT_EXPIRY_SECS: u64 = 3600;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ability {
    pub action: String,
    pub subject: String,
}

/// What a verified token says about its bearer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claims {
    pub user_id: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub abilities: Vec<Ability>,
    #[serde(default)]
    pub first_name: String,
    #[serde(default)]
    pub last_name: String,
    /// Expiry, seconds since the epoch.
    pub exp: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iat: Option<u64>,
}

impl Claims {
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            username: String::new(),
            email: String::new(),
            abilities: vec![],
            first_name: String::new(),
            last_name: String::new(),
            exp: 0,
            iat: None,
        }
    }

    pub fn with_ability(mut self, action: impl Into<String>, subject: impl Into<String>) -> Self {
        self.abilities.push(Ability {
            action: action.into(),
            subject: subject.into(),
        });
        self
    }

    pub fn can(&self, action: &str, subject: &str) -> bool {
        self.abilities
            .iter()
            .any(|a| a.action == action && a.subject == subject)
    }
}

/// Signs and checks tokens with one shared secret.
#[derive(Clone)]
pub struct TokenVerifier {
    encoding: EncodingKey,
    decoding: DecodingKey,
    validation: Validation,
    expiry: u64,
}

impl TokenVerifier {
    /// `expiry` is in seconds.
    pub fn new(secret: &str, expiry: u64) -> Self {
        Self {
            encoding: EncodingKey::from_secret(secret.as_bytes()),
            decoding: DecodingKey::from_secret(secret.as_bytes()),
            validation: Validation::new(Algorithm::HS256),
            expiry,
        }
    }

    /// Fails when no secret is configured. A zero `token_expiry` means one
    /// hour.
    pub fn from_config(config: &AuthConfig) -> Result<Self> {
        if config.jwt_secret.is_empty() {
            return Err(Error::missing("auth.jwt_secret"));
        }
        let expiry = match config.token_expiry {
            0 => DEFAULT_EXPIRY_SECS,
            secs => secs,
        };
        Ok(Self::new(&config.jwt_secret, expiry))
    }

    /// Signs `claims`, stamping `iat` and `exp` from the configured expiry.
    pub fn issue(&self, claims: &Claims) -> Result<String> {
        let now = get_current_timestamp();
        let claims = Claims {
            iat: Some(now),
            exp: now + self.expiry,
            ..claims.clone()
        };
        encode(&Header::default(), &claims, &self.encoding)
            .map_err(|e| Error::ConfigurationInvalid {
                field: "auth.jwt_secret".into(),
                reason: e.to_string(),
            })
    }

    pub fn verify(&self, token: &str) -> std::result::Result<Claims, HandlerError> {
        decode::<Claims>(token, &self.decoding, &self.validation)
            .map(|data| data.claims)
            .map_err(|e| {
                tracing::debug!(error = %e, "token rejected");
                HandlerError::Unauthorized("invalid or expired token".into())
            })
    }

    /// Verifies the token of an `Authorization: Bearer <token>` header.
    pub fn verify_header(&self, header: Option<&str>) -> std::result::Result<Claims, HandlerError> {
        let token = header
            .and_then(|h| h.strip_prefix(BEARER))
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .ok_or_else(|| {
                HandlerError::Unauthorized("authorization header missing or malformed".into())
            })?;
        self.verify(token)
    }
}

/// Wraps `handler` so it only runs for requests carrying a valid bearer
/// token.
pub fn authenticated<H: Handler>(handler: H) -> Authenticated<H> {
    Authenticated { inner: handler }
}

pub struct Authenticated<H> {
    inner: H,
}

impl<H: Handler> Handler for Authenticated<H> {
    fn call(&self, mut ctx: Context) -> HandlerFuture {
        let verified = TokenVerifier::from_config(ctx.settings().auth())
            .map_err(anyhow::Error::from)
            .and_then(|verifier| Ok(verifier.verify_header(ctx.header("authorization"))?));
        match verified {
            Ok(claims) => {
                ctx.set_claims(claims);
                self.inner.call(ctx)
            }
            Err(e) => Box::pin(async move { Err(e) }),
        }
    }
}
