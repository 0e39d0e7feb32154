#![forbid(unsafe_code)]

use std::sync::Arc;

use parlor_domain::{Room, RoomId, RoomName, UserId};
use thiserror::Error;
use tracing::{debug, warn};

use crate::server::store::{RoomStore, StoreError};
use crate::util::time::unix_now_ms;

/// Attempts at generating a unique room id before giving up.
const CREATE_ID_ATTEMPTS: usize = 3;

/// Room operation failures, each mapped to a distinct response class.
#[derive(Debug, Error)]
pub enum RoomError {
	#[error("room name must not be empty")]
	InvalidName,

	#[error("owner {0} is not a known identity")]
	UnknownOwner(UserId),

	#[error("room not found")]
	NotFound,

	#[error("only the room creator may delete it")]
	PermissionDenied,

	#[error(transparent)]
	Storage(StoreError),
}

impl From<StoreError> for RoomError {
	fn from(err: StoreError) -> Self {
		match err {
			StoreError::UnknownOwner(user) => RoomError::UnknownOwner(user),
			other => RoomError::Storage(other),
		}
	}
}

/// Create, join, exit, delete and list shared rooms.
///
/// A room is either present (active) or absent (deleted, terminal); an empty
/// membership set does not delete a room.
pub struct RoomService {
	store: Arc<dyn RoomStore>,
}

impl RoomService {
	pub fn new(store: Arc<dyn RoomStore>) -> Self {
		Self { store }
	}

	/// Create a room owned (and initially solely populated) by `owner`.
	///
	/// Room ids are random opaque tokens; a store-reported uniqueness
	/// conflict triggers regeneration, bounded by `CREATE_ID_ATTEMPTS`.
	pub async fn create(&self, name: &str, owner: UserId) -> Result<Room, RoomError> {
		let name = RoomName::new(name).map_err(|_| RoomError::InvalidName)?;

		for attempt in 1..=CREATE_ID_ATTEMPTS {
			let room = Room::new(RoomId::generate(), name.clone(), owner, unix_now_ms());
			match self.store.create_room(&room).await {
				Ok(()) => {
					debug!(room = %room.room_id, owner = %owner, "room created");
					return Ok(room);
				}
				Err(StoreError::DuplicateRoomId) => {
					warn!(attempt, "room id collision, regenerating");
				}
				Err(err) => return Err(err.into()),
			}
		}

		Err(RoomError::Storage(StoreError::DuplicateRoomId))
	}

	/// Idempotent membership add.
	pub async fn join(&self, room_id: &RoomId, user: UserId) -> Result<Room, RoomError> {
		self.store.add_member(room_id, user).await?.ok_or(RoomError::NotFound)
	}

	/// Idempotent membership remove. The creator may exit like any other
	/// member; ownership stays put.
	pub async fn exit(&self, room_id: &RoomId, user: UserId) -> Result<Room, RoomError> {
		self.store.remove_member(room_id, user).await?.ok_or(RoomError::NotFound)
	}

	/// Delete a room; only its creator is authorized, member or not.
	pub async fn delete(&self, room_id: &RoomId, requester: UserId) -> Result<(), RoomError> {
		let Some(room) = self.store.find_room(room_id).await? else {
			return Err(RoomError::NotFound);
		};
		if room.created_by != requester {
			return Err(RoomError::PermissionDenied);
		}

		if self.store.delete_room(room_id, requester).await? {
			debug!(room = %room_id, "room deleted");
			Ok(())
		} else {
			// lost a race with another delete of the same room
			Err(RoomError::NotFound)
		}
	}

	/// Snapshot of rooms containing `user`, newest first.
	pub async fn list_for_member(&self, user: UserId) -> Result<Vec<Room>, RoomError> {
		Ok(self.store.rooms_for_member(user).await?)
	}
}
