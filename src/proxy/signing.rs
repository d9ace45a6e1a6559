use chrono::Utc;
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};

use super::whitelist::SigningProfile;
use crate::gateway::s3::S3Credentials;

type HmacSha256 = Hmac<Sha256>;

/// The headers to inject into a forwarded request, computed by
/// [`sign`]. The proxy applies these to the outbound request and never
/// returns them to the sandbox (§4.B.5 credential containment).
#[derive(Debug, Clone)]
pub struct SignedHeaders {
	pub headers: Vec<(String, String)>,
}

/// Compute the headers to inject for `profile` targeting `host` with
/// method/path/body, using host-held credentials the sandbox never sees
/// (§4.B.3). `Transparent` profiles need no injection.
pub fn sign(
	profile: SigningProfile,
	credentials: &S3Credentials,
	region: &str,
	service: &str,
	method: &str,
	host: &str,
	canonical_uri: &str,
	body: &[u8],
) -> SignedHeaders {
	match profile {
		SigningProfile::Transparent => SignedHeaders { headers: vec![] },
		SigningProfile::AwsSigV4 => {
			let now = Utc::now();
			let amz_date = now.format("%Y%m%dT%H%M%SZ").to_string();
			let date_stamp = now.format("%Y%m%d").to_string();
			let payload_hash = hex_sha256(body);

			let mut headers = vec![
				("host".to_string(), host.to_string()),
				("x-amz-date".to_string(), amz_date.clone()),
				("x-amz-content-sha256".to_string(), payload_hash.clone()),
			];
			if let Some(token) = &credentials.session_token {
				headers.push(("x-amz-security-token".to_string(), token.clone()));
			}

			let canonical_headers: String = {
				let mut h = headers.clone();
				h.sort_by(|a, b| a.0.cmp(&b.0));
				h.iter()
					.map(|(k, v)| format!("{}:{}\n", k, v.trim()))
					.collect()
			};
			let signed_headers: String = {
				let mut keys: Vec<&str> = headers.iter().map(|(k, _)| k.as_str()).collect();
				keys.sort();
				keys.join(";")
			};

			let canonical_request = format!(
				"{}\n{}\n\n{}\n{}\n{}",
				method, canonical_uri, canonical_headers, signed_headers, payload_hash
			);
			let credential_scope = format!("{}/{}/{}/aws4_request", date_stamp, region, service);
			let string_to_sign = format!(
				"AWS4-HMAC-SHA256\n{}\n{}\n{}",
				amz_date,
				credential_scope,
				hex_sha256(canonical_request.as_bytes())
			);
			let signing_key =
				derive_signing_key(&credentials.secret_access_key, &date_stamp, region, service);
			let signature = hex_hmac(&signing_key, string_to_sign.as_bytes());

			headers.push((
				"authorization".to_string(),
				format!(
					"AWS4-HMAC-SHA256 Credential={}/{}, SignedHeaders={}, Signature={}",
					credentials.access_key_id, credential_scope, signed_headers, signature
				),
			));

			SignedHeaders { headers }
		}
	}
}

fn hex_sha256(data: &[u8]) -> String {
	let mut hasher = Sha256::new();
	hasher.update(data);
	hex::encode(hasher.finalize())
}

fn hmac_bytes(key: &[u8], data: &[u8]) -> Vec<u8> {
	let mut mac = HmacSha256::new_from_slice(key).expect("HMAC accepts keys of any length");
	mac.update(data);
	mac.finalize().into_bytes().to_vec()
}

fn hex_hmac(key: &[u8], data: &[u8]) -> String {
	hex::encode(hmac_bytes(key, data))
}

fn derive_signing_key(secret: &str, date_stamp: &str, region: &str, service: &str) -> Vec<u8> {
	let k_date = hmac_bytes(format!("AWS4{}", secret).as_bytes(), date_stamp.as_bytes());
	let k_region = hmac_bytes(&k_date, region.as_bytes());
	let k_service = hmac_bytes(&k_region, service.as_bytes());
	hmac_bytes(&k_service, b"aws4_request")
}

#[cfg(feature = "proxy-tests")]
mod tests {
	use super::*;

	fn creds() -> S3Credentials {
		S3Credentials {
			access_key_id: "AKIAFAKE".to_string(),
			secret_access_key: "supersecret".to_string(),
			session_token: None,
		}
	}

	#[test]
	fn transparent_profile_injects_nothing() {
		let signed = sign(
			SigningProfile::Transparent,
			&creds(),
			"us-east-1",
			"s3",
			"GET",
			"example.com",
			"/",
			b"",
		);
		assert!(signed.headers.is_empty());
	}

	#[test]
	fn sigv4_profile_injects_authorization_header() {
		let signed = sign(
			SigningProfile::AwsSigV4,
			&creds(),
			"us-east-1",
			"s3",
			"GET",
			"bucket.s3.amazonaws.com",
			"/",
			b"",
		);
		assert!(signed.headers.iter().any(|(k, _)| k == "authorization"));
	}

	#[test]
	fn sigv4_headers_never_contain_the_raw_secret() {
		let creds = creds();
		let signed = sign(
			SigningProfile::AwsSigV4,
			&creds,
			"us-east-1",
			"s3",
			"GET",
			"bucket.s3.amazonaws.com",
			"/",
			b"",
		);
		for (_, v) in &signed.headers {
			assert!(!v.contains(&creds.secret_access_key));
		}
	}
}
