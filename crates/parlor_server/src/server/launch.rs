#![forbid(unsafe_code)]

use std::collections::BTreeMap;

use hmac::{Hmac, Mac};
use sha2::Sha256;
use thiserror::Error;

use crate::config::SecretString;
use crate::server::store::StoreError;

type HmacSha256 = Hmac<Sha256>;

/// Key literal fixed by the platform's launch-data signing scheme.
const SECRET_KEY_LITERAL: &[u8] = b"WebAppData";

/// Field carrying the claimed signature inside launch data.
pub const HASH_FIELD: &str = "hash";

/// Authentication failures, each mapped to a distinct response class.
#[derive(Debug, Error)]
pub enum AuthError {
	/// Launch token could not be parsed into signed key/value pairs.
	#[error("malformed launch data: {0}")]
	MalformedInput(String),

	/// Signature did not match the canonical payload.
	#[error("launch data signature mismatch")]
	InvalidSignature,

	/// A required identity field was absent or unusable after verification.
	#[error("missing or invalid identity field: {0}")]
	MissingIdentity(String),

	/// Identity persistence failed.
	#[error(transparent)]
	Storage(#[from] StoreError),
}

/// Parsed launch payload: field name to percent-decoded value.
///
/// Transient, lives for one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchData {
	fields: BTreeMap<String, String>,
}

impl LaunchData {
	/// Parse a URL-query-encoded token (`k=v&k=v...`). The token must carry
	/// a `hash` field; later duplicates of a key win.
	pub fn parse(token: &str) -> Result<Self, AuthError> {
		let token = token.trim();
		if token.is_empty() {
			return Err(AuthError::MalformedInput("empty token".to_string()));
		}

		let mut fields = BTreeMap::new();
		for (key, value) in url::form_urlencoded::parse(token.as_bytes()) {
			fields.insert(key.into_owned(), value.into_owned());
		}

		if !fields.contains_key(HASH_FIELD) {
			return Err(AuthError::MalformedInput("no hash field".to_string()));
		}

		Ok(Self { fields })
	}

	pub fn get(&self, field: &str) -> Option<&str> {
		self.fields.get(field).map(String::as_str)
	}

	/// The claimed signature.
	pub fn hash(&self) -> &str {
		self.fields.get(HASH_FIELD).map(String::as_str).unwrap_or_default()
	}

	/// The deterministic signing payload of this launch data.
	pub fn canonical_string(&self) -> String {
		canonical_string(self.fields.iter().map(|(k, v)| (k.as_str(), v.as_str())))
	}
}

/// Canonicalize string pairs into the signing payload: the `hash` entry is
/// dropped, the rest are sorted by key (byte-wise) and joined as `key=value`
/// lines with a single `\n` between entries and none trailing.
///
/// A `hash`-only mapping canonicalizes to the empty string; that is valid
/// input, not an error.
pub fn canonical_string<'a, I>(pairs: I) -> String
where
	I: IntoIterator<Item = (&'a str, &'a str)>,
{
	let mut entries: Vec<(&str, &str)> = pairs.into_iter().filter(|(key, _)| *key != HASH_FIELD).collect();
	entries.sort_by(|a, b| a.0.as_bytes().cmp(b.0.as_bytes()));

	let mut out = String::new();
	for (idx, (key, value)) in entries.iter().enumerate() {
		if idx > 0 {
			out.push('\n');
		}
		out.push_str(key);
		out.push('=');
		out.push_str(value);
	}
	out
}

/// Verifies launch-data signatures for one configured bot token.
///
/// The signing secret is derived once at construction; per-request calls
/// never touch configuration.
pub struct LaunchVerifier {
	secret: [u8; 32],
}

impl LaunchVerifier {
	/// Derive the signing secret:
	/// `HMAC_SHA256(key = "WebAppData", message = bot token)`.
	pub fn new(bot_token: &SecretString) -> Self {
		let mut mac = HmacSha256::new_from_slice(SECRET_KEY_LITERAL).expect("hmac key");
		mac.update(bot_token.expose().as_bytes());
		Self {
			secret: mac.finalize().into_bytes().into(),
		}
	}

	/// Verify a launch token and return its parsed fields (including `hash`).
	///
	/// The computed signature is `HMAC_SHA256(key = secret, message =
	/// canonical payload)`, lowercase hex, compared in constant time.
	pub fn verify(&self, token: &str) -> Result<LaunchData, AuthError> {
		let data = LaunchData::parse(token)?;

		let mut mac = HmacSha256::new_from_slice(&self.secret).expect("hmac key");
		mac.update(data.canonical_string().as_bytes());
		let computed = hex::encode(mac.finalize().into_bytes());

		if !constant_time_eq(computed.as_bytes(), data.hash().as_bytes()) {
			return Err(AuthError::InvalidSignature);
		}

		Ok(data)
	}
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
