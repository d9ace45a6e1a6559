//! Executor authentication (§6 ingress): validates the bearer token on
//! every `/tenants/.../conversations/...` request against the configured
//! OIDC provider. Grounded on the teacher's `sync::auth::OidcProvider`
//! (JWKS fetch + `jsonwebtoken` RS256 validation), relocated here since
//! ingress auth is this repository's actual use for it. With no OIDC
//! provider configured (`AGX_OIDC_DISCOVERY_URL` unset) the ingress runs
//! open, which is the posture a local/dev deployment needs.

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use axum::body::Body;
use axum::extract::State;
use axum::http::{Request, StatusCode, header};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use jsonwebtoken::{Algorithm, DecodingKey, Validation, decode, decode_header};
use log::{debug, info, warn};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::state::AppState;

#[derive(Debug, Deserialize, Clone)]
pub struct OidcDiscoveryDocument {
	pub issuer: String,
	pub jwks_uri: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct Jwks {
	pub keys: Vec<Jwk>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct Jwk {
	pub kty: String,
	pub kid: Option<String>,
	pub n: Option<String>,
	pub e: Option<String>,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct Claims {
	pub sub: String,
	pub iss: String,
	pub aud: String,
	pub exp: u64,
	pub iat: u64,
}

/// OIDC provider used to validate executor bearer tokens on ingress.
pub struct OidcProvider {
	discovery_url: String,
	client_id: String,
	discovery_doc: RwLock<Option<OidcDiscoveryDocument>>,
	jwks: RwLock<Option<Jwks>>,
	client: Client,
}

impl OidcProvider {
	pub fn new(discovery_url: String, client_id: String) -> Self {
		let client = Client::builder()
			.timeout(Duration::from_secs(30))
			.build()
			.expect("failed to build HTTP client for OIDC");

		Self {
			discovery_url,
			client_id,
			discovery_doc: RwLock::new(None),
			jwks: RwLock::new(None),
			client,
		}
	}

	/// Fetch the discovery document and JWKS. Called once at startup; the
	/// ingress refuses to start with OIDC configured but unreachable.
	pub async fn initialize(&self) -> Result<()> {
		info!("fetching OIDC discovery document from {}", self.discovery_url);
		let doc = self
			.client
			.get(&self.discovery_url)
			.send()
			.await
			.context("failed to fetch OIDC discovery document")?
			.json::<OidcDiscoveryDocument>()
			.await
			.context("failed to parse OIDC discovery document")?;
		debug!("OIDC issuer: {}", doc.issuer);

		let jwks = self
			.client
			.get(&doc.jwks_uri)
			.send()
			.await
			.context("failed to fetch JWKS")?
			.json::<Jwks>()
			.await
			.context("failed to parse JWKS")?;
		debug!("fetched {} JWKs", jwks.keys.len());

		*self.discovery_doc.write().await = Some(doc);
		*self.jwks.write().await = Some(jwks);
		Ok(())
	}

	pub async fn validate_token(&self, token: &str) -> Result<Claims> {
		let header = decode_header(token).context("failed to decode JWT header")?;
		let kid = header.kid.context("JWT header missing 'kid' field")?;

		let jwks = self.jwks.read().await;
		let keys = jwks.as_ref().context("JWKS not loaded; call initialize first")?;
		let jwk = keys
			.keys
			.iter()
			.find(|k| k.kid.as_deref() == Some(kid.as_str()))
			.context("no matching key found in JWKS")?;
		if jwk.kty != "RSA" {
			anyhow::bail!("unsupported key type: {}", jwk.kty);
		}
		let n = jwk.n.as_ref().context("JWK missing 'n' parameter")?;
		let e = jwk.e.as_ref().context("JWK missing 'e' parameter")?;
		let decoding_key = DecodingKey::from_rsa_components(n, e).context("failed to construct decoding key")?;

		let discovery = self.discovery_doc.read().await;
		let doc = discovery.as_ref().context("discovery document not loaded")?;

		let mut validation = Validation::new(Algorithm::RS256);
		validation.set_issuer(&[&doc.issuer]);
		validation.set_audience(&[&self.client_id]);

		let token_data = decode::<Claims>(token, &decoding_key, &validation).context("failed to validate JWT")?;

		let now = SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_secs();
		if token_data.claims.exp < now {
			anyhow::bail!("token has expired");
		}
		debug!("token validated for subject: {}", token_data.claims.sub);
		Ok(token_data.claims)
	}
}

pub async fn require_executor_auth(State(state): State<AppState>, req: Request<Body>, next: Next) -> Response {
	let Some(oidc) = state.oidc.as_ref() else {
		return next.run(req).await;
	};

	let token = req
		.headers()
		.get(header::AUTHORIZATION)
		.and_then(|v| v.to_str().ok())
		.and_then(|v| v.strip_prefix("Bearer "));

	let Some(token) = token else {
		return unauthorized("missing bearer token");
	};

	match oidc.validate_token(token).await {
		Ok(_claims) => next.run(req).await,
		Err(e) => {
			warn!("executor auth rejected: {}", e);
			unauthorized("invalid or expired token")
		}
	}
}

fn unauthorized(message: &'static str) -> Response {
	(
		StatusCode::UNAUTHORIZED,
		axum::Json(crate::errors::ErrorBody {
			code: "SECURITY_ERROR",
			message: message.to_string(),
		}),
	)
		.into_response()
}

#[cfg(feature = "unit-tests")]
mod tests {
	use super::*;

	#[test]
	fn provider_constructs_with_given_discovery_url() {
		let provider = OidcProvider::new(
			"https://issuer.example.com/.well-known/openid-configuration".to_string(),
			"client-1".to_string(),
		);
		assert_eq!(
			provider.discovery_url,
			"https://issuer.example.com/.well-known/openid-configuration"
		);
	}
}
