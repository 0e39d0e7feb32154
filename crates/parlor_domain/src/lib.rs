#![forbid(unsafe_code)]

use core::fmt;
use core::str::FromStr;
use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors for parsing identifiers from strings.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseIdError {
	#[error("empty value")]
	Empty,
	#[error("invalid integer id: {0}")]
	InvalidInteger(String),
}

/// Platform-assigned user identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(pub i64);

impl fmt::Display for UserId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}", self.0)
	}
}

impl FromStr for UserId {
	type Err = ParseIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		let s = s.trim();
		if s.is_empty() {
			return Err(ParseIdError::Empty);
		}

		s.parse::<i64>()
			.map(UserId)
			.map_err(|_| ParseIdError::InvalidInteger(s.to_string()))
	}
}

/// Opaque, system-generated room identifier. Unique and immutable once a
/// room is created.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RoomId(String);

impl RoomId {
	/// Create a non-empty `RoomId`.
	pub fn new(id: impl Into<String>) -> Result<Self, ParseIdError> {
		let id = id.into();
		if id.trim().is_empty() {
			return Err(ParseIdError::Empty);
		}
		Ok(Self(id))
	}

	/// Generate a fresh random id: 16 random bytes, hex-encoded.
	pub fn generate() -> Self {
		Self(uuid::Uuid::new_v4().simple().to_string())
	}

	pub fn as_str(&self) -> &str {
		&self.0
	}

	pub fn into_string(self) -> String {
		self.0
	}
}

impl fmt::Display for RoomId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.0)
	}
}

impl FromStr for RoomId {
	type Err = ParseIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		RoomId::new(s.to_string())
	}
}

/// Validated room name: non-empty after trimming, stored trimmed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RoomName(String);

impl RoomName {
	/// Create a `RoomName`, trimming surrounding whitespace.
	pub fn new(name: impl Into<String>) -> Result<Self, ParseIdError> {
		let name = name.into();
		let trimmed = name.trim();
		if trimmed.is_empty() {
			return Err(ParseIdError::Empty);
		}
		Ok(Self(trimmed.to_string()))
	}

	pub fn as_str(&self) -> &str {
		&self.0
	}

	pub fn into_string(self) -> String {
		self.0
	}
}

impl fmt::Display for RoomName {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.0)
	}
}

impl FromStr for RoomName {
	type Err = ParseIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		RoomName::new(s.to_string())
	}
}

/// Authenticated platform user, refreshed on every successful login.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
	pub id: UserId,
	pub first_name: String,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub last_name: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub username: Option<String>,
	pub language: String,
}

impl Identity {
	/// Language used when the launch payload carries none.
	pub const DEFAULT_LANGUAGE: &'static str = "en";
}

/// Shared room with an owner and a membership set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Room {
	pub room_id: RoomId,
	pub room_name: RoomName,
	pub created_by: UserId,
	pub members: BTreeSet<UserId>,
	/// Creation time, Unix milliseconds.
	pub created_at: i64,
}

impl Room {
	/// Construct a room whose creator is its first member.
	pub fn new(room_id: RoomId, room_name: RoomName, created_by: UserId, created_at: i64) -> Self {
		let mut members = BTreeSet::new();
		members.insert(created_by);
		Self {
			room_id,
			room_name,
			created_by,
			members,
			created_at,
		}
	}

	pub fn is_member(&self, user: UserId) -> bool {
		self.members.contains(&user)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn user_id_parse_and_display() {
		assert_eq!("42".parse::<UserId>().unwrap(), UserId(42));
		assert_eq!(" -7 ".parse::<UserId>().unwrap(), UserId(-7));
		assert_eq!(UserId(42).to_string(), "42");
	}

	#[test]
	fn user_id_rejects_non_integers() {
		assert_eq!("".parse::<UserId>().unwrap_err(), ParseIdError::Empty);
		assert!(matches!("abc".parse::<UserId>(), Err(ParseIdError::InvalidInteger(_))));
	}

	#[test]
	fn room_name_is_trimmed() {
		let name = RoomName::new("  Lab Room  ").unwrap();
		assert_eq!(name.as_str(), "Lab Room");
	}

	#[test]
	fn rejects_empty_names_and_ids() {
		assert!(RoomName::new("   ").is_err());
		assert!(RoomId::new("").is_err());
	}

	#[test]
	fn generated_room_ids_are_distinct_hex() {
		let a = RoomId::generate();
		let b = RoomId::generate();
		assert_ne!(a, b);
		assert_eq!(a.as_str().len(), 32);
		assert!(a.as_str().chars().all(|c| c.is_ascii_hexdigit()));
	}

	#[test]
	fn new_room_contains_its_creator() {
		let room = Room::new(
			RoomId::generate(),
			RoomName::new("general").unwrap(),
			UserId(1),
			1_000,
		);
		assert!(room.is_member(UserId(1)));
		assert!(!room.is_member(UserId(2)));
		assert_eq!(room.members.len(), 1);
	}
}
