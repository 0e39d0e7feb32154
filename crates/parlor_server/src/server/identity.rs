#![forbid(unsafe_code)]

use std::sync::Arc;

use parlor_domain::{Identity, UserId};
use tracing::debug;

use crate::config::IdentityFieldNames;
use crate::server::launch::{AuthError, LaunchData, LaunchVerifier};
use crate::server::store::RoomStore;

/// Extract a structured identity from verified launch data.
///
/// Performs no I/O. The id field must hold a valid integer and the
/// first-name field must be present; everything else is optional.
pub fn extract_identity(data: &LaunchData, fields: &IdentityFieldNames) -> Result<Identity, AuthError> {
	let raw_id = data
		.get(&fields.id)
		.ok_or_else(|| AuthError::MissingIdentity(fields.id.clone()))?;
	let id: i64 = raw_id
		.trim()
		.parse()
		.map_err(|_| AuthError::MissingIdentity(fields.id.clone()))?;

	let first_name = data
		.get(&fields.first_name)
		.ok_or_else(|| AuthError::MissingIdentity(fields.first_name.clone()))?;

	let language = data
		.get(&fields.language)
		.filter(|v| !v.is_empty())
		.unwrap_or(Identity::DEFAULT_LANGUAGE);

	Ok(Identity {
		id: UserId(id),
		first_name: first_name.to_string(),
		last_name: data.get(&fields.last_name).filter(|v| !v.is_empty()).map(str::to_string),
		username: data.get(&fields.username).filter(|v| !v.is_empty()).map(str::to_string),
		language: language.to_string(),
	})
}

/// Verifies launch data and keeps the identity record fresh.
pub struct AuthService {
	verifier: LaunchVerifier,
	fields: IdentityFieldNames,
	store: Arc<dyn RoomStore>,
}

impl AuthService {
	pub fn new(verifier: LaunchVerifier, fields: IdentityFieldNames, store: Arc<dyn RoomStore>) -> Self {
		Self { verifier, fields, store }
	}

	/// Authenticate one launch token: verify the signature, extract the
	/// identity and upsert its record (latest wins).
	pub async fn authenticate(&self, token: &str) -> Result<Identity, AuthError> {
		let data = self.verifier.verify(token)?;
		let identity = extract_identity(&data, &self.fields)?;
		self.store.upsert_identity(&identity).await?;

		debug!(user = %identity.id, "identity refreshed");
		Ok(identity)
	}

	/// Signature check without persistence, for request gating.
	pub fn verify_only(&self, token: &str) -> Result<LaunchData, AuthError> {
		self.verifier.verify(token)
	}
}
