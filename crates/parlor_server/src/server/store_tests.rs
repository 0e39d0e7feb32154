#![forbid(unsafe_code)]

use parlor_domain::{Identity, Room, RoomId, RoomName, UserId};

use crate::server::store::{MemoryRoomStore, RoomStore, StoreError};

fn identity(id: i64, first_name: &str) -> Identity {
	Identity {
		id: UserId(id),
		first_name: first_name.to_string(),
		last_name: None,
		username: None,
		language: "en".to_string(),
	}
}

fn room(id: &str, created_by: i64, created_at: i64) -> Room {
	Room::new(
		RoomId::new(id).unwrap(),
		RoomName::new(format!("room {id}")).unwrap(),
		UserId(created_by),
		created_at,
	)
}

#[tokio::test]
async fn identity_upsert_is_latest_wins() {
	let store = MemoryRoomStore::default();
	store.upsert_identity(&identity(1, "Ada")).await.unwrap();

	let mut refreshed = identity(1, "Grace");
	refreshed.username = Some("grace".to_string());
	store.upsert_identity(&refreshed).await.unwrap();

	let found = store.find_identity(UserId(1)).await.unwrap().unwrap();
	assert_eq!(found.first_name, "Grace");
	assert_eq!(found.username.as_deref(), Some("grace"));
}

#[tokio::test]
async fn create_room_requires_a_known_owner() {
	let store = MemoryRoomStore::default();

	let result = store.create_room(&room("a", 1, 1_000)).await;
	assert!(matches!(result, Err(StoreError::UnknownOwner(UserId(1)))));

	// nothing became visible from the failed create
	assert!(store.find_room(&RoomId::new("a").unwrap()).await.unwrap().is_none());
}

#[tokio::test]
async fn duplicate_room_ids_are_rejected() {
	let store = MemoryRoomStore::default();
	store.upsert_identity(&identity(1, "Ada")).await.unwrap();

	store.create_room(&room("a", 1, 1_000)).await.unwrap();
	let result = store.create_room(&room("a", 1, 2_000)).await;
	assert!(matches!(result, Err(StoreError::DuplicateRoomId)));
}

#[tokio::test]
async fn membership_mutations_on_absent_rooms_report_none() {
	let store = MemoryRoomStore::default();
	let missing = RoomId::new("missing").unwrap();

	assert!(store.add_member(&missing, UserId(1)).await.unwrap().is_none());
	assert!(store.remove_member(&missing, UserId(1)).await.unwrap().is_none());
}

#[tokio::test]
async fn delete_is_conditional_on_the_creator() {
	let store = MemoryRoomStore::default();
	store.upsert_identity(&identity(1, "Ada")).await.unwrap();
	store.create_room(&room("a", 1, 1_000)).await.unwrap();

	let room_id = RoomId::new("a").unwrap();
	assert!(!store.delete_room(&room_id, UserId(2)).await.unwrap());
	assert!(store.find_room(&room_id).await.unwrap().is_some());

	assert!(store.delete_room(&room_id, UserId(1)).await.unwrap());
	assert!(store.find_room(&room_id).await.unwrap().is_none());
}

#[tokio::test]
async fn membership_is_a_set() {
	let store = MemoryRoomStore::default();
	store.upsert_identity(&identity(1, "Ada")).await.unwrap();
	store.create_room(&room("a", 1, 1_000)).await.unwrap();

	let room_id = RoomId::new("a").unwrap();
	store.add_member(&room_id, UserId(2)).await.unwrap();
	let after = store.add_member(&room_id, UserId(2)).await.unwrap().unwrap();
	assert_eq!(after.members.len(), 2);

	let after = store.remove_member(&room_id, UserId(9)).await.unwrap().unwrap();
	assert_eq!(after.members.len(), 2);
}
