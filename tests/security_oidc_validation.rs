//! Executor OIDC bearer token validation (`ingress::auth::OidcProvider`).
//!
//! Runs a throwaway discovery + JWKS server on localhost and drives
//! `OidcProvider::initialize`/`validate_token` against it with tokens
//! signed against a fixed RSA test keypair.

use std::time::{SystemTime, UNIX_EPOCH};

use agent_substrate::ingress::auth::OidcProvider;
use axum::{Json, Router, routing::get};
use jsonwebtoken::{Algorithm, EncodingKey, Header, encode};
use serde::Serialize;
use serde_json::json;
use tokio::net::TcpListener;

const CLIENT_ID: &str = "test-client";

const TEST_PRIVATE_KEY_PEM: &str = include_str!("fixtures/oidc_test_key.pem");
const TEST_N_B64: &str = "v1z0dFGujwqLLiWMbKX62sHu2RqueBmAnYQTnJkcyz-Z4ca0zAwcql7eGGwsuDLA1kbdbbam3X_ok-3h_kcfvGmqxiRWwxf2sbZlfKg5UJQbfIU5CN_9T3zXbz4qcl_yoqvo_OXkjz4S4mGW5yan2C7XRsXNIU21pdEZ2Moa5OhntTQgcWGsmOCLGqtoWhXVl5u8N8E41SRs2sojiIPVARmm4iMWq3EgwHjVnSYY1lpf_fqB9sBEJdPQbDJX8l5_JAF6TpHYK8eqNhlwXYg5qnaNDmigW1M0P1fbU8-i-IoIBYm2Eq5rHYH-1Ylw7R0hQJo6lvDX_b1tvYXnoht3IQ";
const TEST_E_B64: &str = "AQAB";
const KID: &str = "test-kid-1";

#[derive(Serialize)]
struct Claims {
	sub: String,
	iss: String,
	aud: String,
	exp: u64,
	iat: u64,
}

fn now() -> u64 {
	SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_secs()
}

fn sign(claims: &Claims, key_pem: &str, kid: &str) -> String {
	let mut header = Header::new(Algorithm::RS256);
	header.kid = Some(kid.to_string());
	let key = EncodingKey::from_rsa_pem(key_pem.as_bytes()).expect("valid test RSA key");
	encode(&header, claims, &key).expect("sign test token")
}

/// Starts a discovery + JWKS server on an ephemeral port and returns its
/// `issuer`/discovery URL.
async fn start_mock_issuer() -> (String, String) {
	let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
	let addr = listener.local_addr().unwrap();
	let issuer = format!("http://{addr}");
	let issuer_for_doc = issuer.clone();

	let app = Router::new()
		.route(
			"/.well-known/openid-configuration",
			get(move || {
				let issuer = issuer_for_doc.clone();
				async move {
					Json(json!({
						"issuer": issuer,
						"jwks_uri": format!("{issuer}/jwks.json"),
					}))
				}
			}),
		)
		.route(
			"/jwks.json",
			get(|| async {
				Json(json!({
					"keys": [{
						"kty": "RSA",
						"kid": KID,
						"n": TEST_N_B64,
						"e": TEST_E_B64,
					}]
				}))
			}),
		);

	tokio::spawn(async move {
		axum::serve(listener, app).await.unwrap();
	});

	(issuer, format!("http://{addr}/.well-known/openid-configuration"))
}

async fn provider() -> (OidcProvider, String) {
	let (issuer, discovery_url) = start_mock_issuer().await;
	let provider = OidcProvider::new(discovery_url, CLIENT_ID.to_string());
	provider.initialize().await.expect("discovery + jwks fetch");
	(provider, issuer)
}

#[tokio::test]
async fn valid_token_is_accepted() {
	let (provider, issuer) = provider().await;
	let token = sign(
		&Claims {
			sub: "executor-1".to_string(),
			iss: issuer,
			aud: CLIENT_ID.to_string(),
			exp: now() + 300,
			iat: now(),
		},
		TEST_PRIVATE_KEY_PEM,
		KID,
	);
	let claims = provider.validate_token(&token).await.expect("token should validate");
	assert_eq!(claims.sub, "executor-1");
}

#[tokio::test]
async fn expired_token_is_rejected() {
	let (provider, issuer) = provider().await;
	let token = sign(
		&Claims {
			sub: "executor-1".to_string(),
			iss: issuer,
			aud: CLIENT_ID.to_string(),
			exp: now() - 60,
			iat: now() - 600,
		},
		TEST_PRIVATE_KEY_PEM,
		KID,
	);
	assert!(provider.validate_token(&token).await.is_err());
}

#[tokio::test]
async fn wrong_issuer_is_rejected() {
	let (provider, _issuer) = provider().await;
	let token = sign(
		&Claims {
			sub: "executor-1".to_string(),
			iss: "https://not-the-configured-issuer.example.com".to_string(),
			aud: CLIENT_ID.to_string(),
			exp: now() + 300,
			iat: now(),
		},
		TEST_PRIVATE_KEY_PEM,
		KID,
	);
	assert!(provider.validate_token(&token).await.is_err());
}

#[tokio::test]
async fn wrong_audience_is_rejected() {
	let (provider, issuer) = provider().await;
	let token = sign(
		&Claims {
			sub: "executor-1".to_string(),
			iss: issuer,
			aud: "some-other-client".to_string(),
			exp: now() + 300,
			iat: now(),
		},
		TEST_PRIVATE_KEY_PEM,
		KID,
	);
	assert!(provider.validate_token(&token).await.is_err());
}

#[tokio::test]
async fn unknown_kid_is_rejected() {
	let (provider, issuer) = provider().await;
	let token = sign(
		&Claims {
			sub: "executor-1".to_string(),
			iss: issuer,
			aud: CLIENT_ID.to_string(),
			exp: now() + 300,
			iat: now(),
		},
		TEST_PRIVATE_KEY_PEM,
		"some-other-kid",
	);
	assert!(provider.validate_token(&token).await.is_err());
}

#[tokio::test]
async fn malformed_token_is_rejected() {
	let (provider, _issuer) = provider().await;
	assert!(provider.validate_token("not.a.jwt").await.is_err());
}
