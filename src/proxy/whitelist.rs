use serde::Deserialize;

/// Signing profile selected for a whitelist entry (§4.B.3). `None` means
/// transparent forwarding after whitelist approval with no credential
/// injection at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SigningProfile {
	/// AWS SigV4, using host-held static or session credentials.
	AwsSigV4,
	/// No signing: act as a transparent forward proxy.
	Transparent,
}

impl SigningProfile {
	/// Whether this profile requires header injection that cannot be
	/// applied to an opaque `CONNECT` tunnel unless TLS is terminated at
	/// the proxy (§4.B.4).
	pub fn requires_header_injection(&self) -> bool {
		matches!(self, SigningProfile::AwsSigV4)
	}
}

#[derive(Debug, Clone, Deserialize)]
pub struct WhitelistEntry {
	pub host_pattern: String,
	pub allowed_methods: Vec<String>,
	pub signing_profile: SigningProfile,
}

/// Immutable whitelist built at startup (§3, §4.B.2). `169.254.169.254` and
/// other link-local addresses are permanently denied regardless of any
/// configured entry — this can never be relaxed by configuration.
#[derive(Debug, Clone)]
pub struct Whitelist {
	entries: Vec<WhitelistEntry>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WhitelistVerdict<'a> {
	Allowed { signing_profile: SigningProfile },
	Denied(&'a str),
}

impl Whitelist {
	pub fn new(entries: Vec<WhitelistEntry>) -> Self {
		Self { entries }
	}

	pub fn from_json(data: &str) -> anyhow::Result<Self> {
		let entries: Vec<WhitelistEntry> = serde_json::from_str(data)?;
		Ok(Self::new(entries))
	}

	/// Evaluate `host` + `method` against the whitelist. Matching is exact
	/// host or suffix-after-leading-dot; the metadata service and any
	/// link-local address are permanently denied before any entry is
	/// consulted (§3 "Whitelist entry", scenario 5 in §8).
	pub fn evaluate(&self, host: &str, method: &str) -> WhitelistVerdict<'static> {
		if is_permanently_denied(host) {
			return WhitelistVerdict::Denied("link-local or metadata address");
		}

		for entry in &self.entries {
			if host_matches(&entry.host_pattern, host)
				&& entry
					.allowed_methods
					.iter()
					.any(|m| m.eq_ignore_ascii_case(method))
			{
				return WhitelistVerdict::Allowed {
					signing_profile: entry.signing_profile,
				};
			}
		}

		WhitelistVerdict::Denied("host not in whitelist")
	}
}

fn host_matches(pattern: &str, host: &str) -> bool {
	if let Some(suffix) = pattern.strip_prefix('.') {
		host.eq_ignore_ascii_case(suffix) || host.to_ascii_lowercase().ends_with(&format!(".{}", suffix.to_ascii_lowercase()))
	} else {
		host.eq_ignore_ascii_case(pattern)
	}
}

/// `169.254.169.254` (the cloud metadata service) and the broader
/// `169.254.0.0/16` link-local range are always denied, independent of the
/// configured whitelist (§3, §8 scenario 5).
fn is_permanently_denied(host: &str) -> bool {
	if host == "169.254.169.254" {
		return true;
	}
	if let Ok(ip) = host.parse::<std::net::Ipv4Addr>() {
		return ip.octets()[0] == 169 && ip.octets()[1] == 254;
	}
	if let Ok(ip) = host.parse::<std::net::Ipv6Addr>() {
		return ip.is_unicast_link_local();
	}
	false
}

#[cfg(feature = "proxy-tests")]
mod tests {
	use super::*;

	fn wl() -> Whitelist {
		Whitelist::new(vec![
			WhitelistEntry {
				host_pattern: "api.anthropic.com".to_string(),
				allowed_methods: vec!["GET".to_string(), "POST".to_string()],
				signing_profile: SigningProfile::Transparent,
			},
			WhitelistEntry {
				host_pattern: ".s3.amazonaws.com".to_string(),
				allowed_methods: vec!["GET".to_string(), "PUT".to_string()],
				signing_profile: SigningProfile::AwsSigV4,
			},
		])
	}

	#[test]
	fn exact_host_match_allowed() {
		let v = wl().evaluate("api.anthropic.com", "POST");
		assert!(matches!(v, WhitelistVerdict::Allowed { .. }));
	}

	#[test]
	fn suffix_match_allowed() {
		let v = wl().evaluate("my-bucket.s3.amazonaws.com", "GET");
		assert!(matches!(v, WhitelistVerdict::Allowed { .. }));
	}

	#[test]
	fn non_whitelisted_host_denied() {
		let v = wl().evaluate("evil.example.com", "GET");
		assert!(matches!(v, WhitelistVerdict::Denied(_)));
	}

	#[test]
	fn disallowed_method_on_whitelisted_host_denied() {
		let v = wl().evaluate("api.anthropic.com", "DELETE");
		assert!(matches!(v, WhitelistVerdict::Denied(_)));
	}

	#[test]
	fn metadata_service_always_denied() {
		let v = wl().evaluate("169.254.169.254", "GET");
		assert!(matches!(v, WhitelistVerdict::Denied(_)));
	}

	#[test]
	fn link_local_range_always_denied() {
		let v = wl().evaluate("169.254.1.1", "GET");
		assert!(matches!(v, WhitelistVerdict::Denied(_)));
	}

	#[test]
	fn signing_profile_requiring_header_injection() {
		assert!(SigningProfile::AwsSigV4.requires_header_injection());
		assert!(!SigningProfile::Transparent.requires_header_injection());
	}
}
