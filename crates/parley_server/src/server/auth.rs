use std::time::Duration;

use chrono::Utc;
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation, decode, encode};
use parley_domain::{Identity, UserId};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_tungstenite::tungstenite::handshake::server::Request;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;

/// Issuer stamped into tokens by the account service.
pub const DEFAULT_ISSUER: &str = "realtime-chat";

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AuthError {
	#[error("missing bearer token")]
	Missing,
	#[error("malformed token: {0}")]
	Malformed(String),
	#[error("invalid token signature")]
	BadSignature,
	#[error("token expired")]
	Expired,
	#[error("unexpected token issuer")]
	WrongIssuer,
}

impl From<jsonwebtoken::errors::Error> for AuthError {
	fn from(e: jsonwebtoken::errors::Error) -> Self {
		match e.kind() {
			ErrorKind::ExpiredSignature => AuthError::Expired,
			ErrorKind::InvalidSignature => AuthError::BadSignature,
			ErrorKind::InvalidIssuer => AuthError::WrongIssuer,
			ErrorKind::MissingRequiredClaim(claim) if claim == "iss" => AuthError::WrongIssuer,
			_ => AuthError::Malformed(e.to_string()),
		}
	}
}

/// Credential validation at upgrade time.
pub trait AuthGate: Send + Sync {
	fn validate(&self, token: &str) -> Result<Identity, AuthError>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
	pub uid: i64,
	pub un: String,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub iss: Option<String>,
	pub exp: i64,
}

/// HS256 JWT verifier.
#[derive(Clone)]
pub struct JwtAuthGate {
	encoding: EncodingKey,
	decoding: DecodingKey,
	validation: Validation,
	issuer: Option<String>,
}

impl std::fmt::Debug for JwtAuthGate {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("JwtAuthGate")
			.field("secret", &"<redacted>")
			.field("issuer", &self.issuer)
			.finish()
	}
}

impl JwtAuthGate {
	pub fn new(secret: impl AsRef<[u8]>, issuer: Option<String>) -> Self {
		let secret = secret.as_ref();

		let mut validation = Validation::new(Algorithm::HS256);
		validation.leeway = 0;
		validation.set_required_spec_claims(&["exp"]);
		if let Some(iss) = issuer.as_deref() {
			validation.set_issuer(&[iss]);
		}

		Self {
			encoding: EncodingKey::from_secret(secret),
			decoding: DecodingKey::from_secret(secret),
			validation,
			issuer,
		}
	}

	/// Mint a token. Used by tests and local tooling; production tokens come from the account service.
	pub fn issue(&self, identity: &Identity, ttl: Duration) -> Result<String, jsonwebtoken::errors::Error> {
		let ttl = i64::try_from(ttl.as_secs()).unwrap_or(i64::MAX);
		self.sign(&Claims {
			uid: identity.user_id.get(),
			un: identity.username.clone(),
			iss: self.issuer.clone(),
			exp: Utc::now().timestamp().saturating_add(ttl),
		})
	}

	pub fn sign(&self, claims: &Claims) -> Result<String, jsonwebtoken::errors::Error> {
		encode(&Header::new(Algorithm::HS256), claims, &self.encoding)
	}
}

impl AuthGate for JwtAuthGate {
	fn validate(&self, token: &str) -> Result<Identity, AuthError> {
		let token = token.trim();
		if token.is_empty() {
			return Err(AuthError::Missing);
		}

		let claims = decode::<Claims>(token, &self.decoding, &self.validation)?.claims;

		let user_id = UserId::new(claims.uid).map_err(|e| AuthError::Malformed(format!("uid: {e}")))?;
		if claims.un.trim().is_empty() {
			return Err(AuthError::Malformed("empty username".to_string()));
		}

		Ok(Identity::new(user_id, claims.un))
	}
}

/// Bearer token from `Authorization: Bearer <token>`, falling back to the `token` query parameter.
pub fn bearer_token(req: &Request) -> Option<String> {
	if let Some(value) = req.headers().get(AUTHORIZATION).and_then(|v| v.to_str().ok()) {
		let value = value.trim();
		if let Some(token) = value
			.strip_prefix("Bearer ")
			.or_else(|| value.strip_prefix("bearer "))
			.map(str::trim)
			.filter(|t| !t.is_empty())
		{
			return Some(token.to_string());
		}
	}

	req.uri()
		.query()?
		.split('&')
		.filter_map(|pair| pair.split_once('='))
		.find(|(k, _)| *k == "token")
		.map(|(_, v)| v.trim().to_string())
		.filter(|v| !v.is_empty())
}
