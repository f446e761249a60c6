#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use hmac::{Hmac, Mac};
use huddle_domain::{SessionId, User, UserId};
use huddle_store::{AuthVerifier, Cache, Clock, UserRepo, cache_get_json, cache_set_json, keys};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use thiserror::Error;
use tracing::debug;

use crate::util::secret::SecretString;

/// Resolved-user cache TTL.
const USER_CACHE_TTL: Duration = Duration::from_secs(300);

/// Session-fatal authentication errors, mapped to wire codes.
#[derive(Debug, Error)]
pub enum AuthError {
	#[error("token expired")]
	TokenExpired,
	#[error("invalid token")]
	InvalidToken,
	#[error("invalid session")]
	InvalidSession,
	#[error("user not found")]
	UserNotFound,
	#[error(transparent)]
	Internal(#[from] anyhow::Error),
}

impl AuthError {
	pub fn code(&self) -> &'static str {
		match self {
			Self::TokenExpired => "TOKEN_EXPIRED",
			Self::InvalidToken => "INVALID_TOKEN",
			Self::InvalidSession => "INVALID_SESSION",
			Self::UserNotFound => "USER_NOT_FOUND",
			Self::Internal(_) => "INTERNAL_ERROR",
		}
	}
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthClaims {
	pub sub: String,
	pub exp: u64,
}

/// Verify a `v1.<payload>.<sig>` bearer token against the HMAC secret.
pub fn verify_hmac_token(token: &str, secret: &str, now_secs: u64) -> Result<AuthClaims, AuthError> {
	let parts = token.split('.').collect::<Vec<_>>();
	if parts.len() != 3 || parts[0] != "v1" {
		return Err(AuthError::InvalidToken);
	}

	let payload_b64 = parts[1];
	let sig_b64 = parts[2];

	let payload = URL_SAFE_NO_PAD.decode(payload_b64).map_err(|_| AuthError::InvalidToken)?;
	let expected_sig = sign(payload_b64.as_bytes(), secret.as_bytes());
	let provided_sig = URL_SAFE_NO_PAD.decode(sig_b64).map_err(|_| AuthError::InvalidToken)?;

	if !constant_time_eq(&expected_sig, &provided_sig) {
		return Err(AuthError::InvalidToken);
	}

	let claims: AuthClaims = serde_json::from_slice(&payload).map_err(|_| AuthError::InvalidToken)?;
	if claims.exp <= now_secs {
		return Err(AuthError::TokenExpired);
	}

	Ok(claims)
}

/// Mint a token for `user` expiring at `exp` (Unix seconds). The auth
/// subsystem issues these in production; the server only needs it for dev
/// tooling and tests.
pub fn issue_hmac_token(user: &UserId, exp: u64, secret: &str) -> String {
	let claims = AuthClaims {
		sub: user.as_str().to_string(),
		exp,
	};
	let payload = serde_json::to_vec(&claims).unwrap_or_default();
	let payload_b64 = URL_SAFE_NO_PAD.encode(payload);
	let sig = sign(payload_b64.as_bytes(), secret.as_bytes());
	format!("v1.{payload_b64}.{}", URL_SAFE_NO_PAD.encode(sig))
}

fn sign(payload_b64: &[u8], secret: &[u8]) -> Vec<u8> {
	let mut mac = Hmac::<Sha256>::new_from_slice(secret).expect("hmac key");
	mac.update(payload_b64);
	mac.finalize().into_bytes().to_vec()
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
	if a.len() != b.len() {
		return false;
	}

	let mut diff = 0u8;
	for (x, y) in a.iter().zip(b.iter()) {
		diff |= x ^ y;
	}

	diff == 0
}

/// Session-open authentication: token signature, session validity, user
/// resolution with a short-TTL cache.
pub struct SessionAuthenticator {
	secret: SecretString,
	verifier: Arc<dyn AuthVerifier>,
	users: Arc<dyn UserRepo>,
	cache: Arc<dyn Cache>,
	clock: Arc<dyn Clock>,
}

impl SessionAuthenticator {
	pub fn new(
		secret: SecretString,
		verifier: Arc<dyn AuthVerifier>,
		users: Arc<dyn UserRepo>,
		cache: Arc<dyn Cache>,
		clock: Arc<dyn Clock>,
	) -> Self {
		Self {
			secret,
			verifier,
			users,
			cache,
			clock,
		}
	}

	/// Verify a bearer token alone and return its subject.
	pub fn verify_token(&self, token: &str) -> Result<UserId, AuthError> {
		let now_secs = (self.clock.now_ms() / 1000) as u64;
		let claims = verify_hmac_token(token, self.secret.expose(), now_secs)?;
		UserId::new(claims.sub).map_err(|_| AuthError::InvalidToken)
	}

	/// Full session-open authentication.
	pub async fn authenticate(&self, token: &str, session_id: &SessionId) -> Result<User, AuthError> {
		let user_id = self.verify_token(token)?;

		let valid = self
			.verifier
			.validate_session(&user_id, session_id)
			.await
			.context("validate session")?;
		if !valid {
			return Err(AuthError::InvalidSession);
		}

		let user = self.resolve_user(&user_id).await?;

		// Last-activity bump happens off the handshake path.
		self.touch_session(&user_id, session_id);

		Ok(user)
	}

	/// Bump session last-activity in the background. Best-effort.
	pub fn touch_session(&self, user_id: &UserId, session_id: &SessionId) {
		let verifier = Arc::clone(&self.verifier);
		let user_id = user_id.clone();
		let session_id = session_id.clone();
		tokio::spawn(async move {
			if let Err(e) = verifier.touch_session(&user_id, &session_id).await {
				debug!(user = %user_id, error = %e, "session touch failed");
			}
		});
	}

	async fn resolve_user(&self, user_id: &UserId) -> Result<User, AuthError> {
		let key = keys::user(user_id);
		if let Some(user) = cache_get_json::<User>(self.cache.as_ref(), &key).await {
			metrics::counter!("huddle_server_user_cache_hits_total").increment(1);
			return Ok(user);
		}

		let user = self
			.users
			.get(user_id)
			.await
			.context("resolve user")?
			.ok_or(AuthError::UserNotFound)?;

		cache_set_json(self.cache.as_ref(), &key, &user, USER_CACHE_TTL).await;
		Ok(user)
	}
}
