#![forbid(unsafe_code)]

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use parlor_domain::{Identity, Room, RoomId, RoomName, UserId};

use crate::server::rooms::{RoomError, RoomService};
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

async fn service_with_users(ids: &[i64]) -> (Arc<RoomService>, Arc<MemoryRoomStore>) {
	let store = Arc::new(MemoryRoomStore::default());
	for id in ids {
		store.upsert_identity(&identity(*id, "User")).await.expect("upsert identity");
	}

	let shared: Arc<dyn RoomStore> = store.clone();
	(Arc::new(RoomService::new(shared)), store)
}

#[tokio::test]
async fn create_rejects_blank_names() {
	let (service, _) = service_with_users(&[42]).await;
	assert!(matches!(service.create("   ", UserId(42)).await, Err(RoomError::InvalidName)));
}

#[tokio::test]
async fn create_rejects_unknown_owners() {
	let (service, _) = service_with_users(&[42]).await;
	assert!(matches!(
		service.create("Lab Room", UserId(99)).await,
		Err(RoomError::UnknownOwner(UserId(99)))
	));
}

#[tokio::test]
async fn creator_is_the_sole_initial_member() {
	let (service, _) = service_with_users(&[42]).await;
	let room = service.create("Lab Room", UserId(42)).await.unwrap();

	assert_eq!(room.room_name.as_str(), "Lab Room");
	assert_eq!(room.created_by, UserId(42));
	assert!(room.is_member(UserId(42)));
	assert_eq!(room.members.len(), 1);
}

#[tokio::test]
async fn join_is_idempotent() {
	let (service, _) = service_with_users(&[42]).await;
	let room = service.create("Lab Room", UserId(42)).await.unwrap();

	let after_first = service.join(&room.room_id, UserId(7)).await.unwrap();
	let after_second = service.join(&room.room_id, UserId(7)).await.unwrap();

	assert_eq!(after_first.members, after_second.members);
	assert_eq!(after_second.members.len(), 2);
}

#[tokio::test]
async fn exit_of_an_absent_member_is_a_noop() {
	let (service, _) = service_with_users(&[42]).await;
	let room = service.create("Lab Room", UserId(42)).await.unwrap();

	let after = service.exit(&room.room_id, UserId(9)).await.unwrap();
	assert_eq!(after.members, room.members);
}

#[tokio::test]
async fn ownership_outlives_membership() {
	let (service, _) = service_with_users(&[42, 7]).await;
	let room = service.create("Lab Room", UserId(42)).await.unwrap();
	service.join(&room.room_id, UserId(7)).await.unwrap();

	// the owner exits but still owns the room
	let after_exit = service.exit(&room.room_id, UserId(42)).await.unwrap();
	assert!(!after_exit.is_member(UserId(42)));
	assert_eq!(after_exit.created_by, UserId(42));

	assert!(matches!(
		service.delete(&room.room_id, UserId(7)).await,
		Err(RoomError::PermissionDenied)
	));
	service.delete(&room.room_id, UserId(42)).await.unwrap();
}

#[tokio::test]
async fn delete_by_non_creator_is_denied() {
	let (service, _) = service_with_users(&[42, 7]).await;
	let room = service.create("Lab Room", UserId(42)).await.unwrap();
	service.join(&room.room_id, UserId(7)).await.unwrap();

	assert!(matches!(
		service.delete(&room.room_id, UserId(7)).await,
		Err(RoomError::PermissionDenied)
	));

	// still there
	let listed = service.list_for_member(UserId(7)).await.unwrap();
	assert_eq!(listed.len(), 1);
}

#[tokio::test]
async fn deleted_rooms_stay_deleted() {
	let (service, _) = service_with_users(&[42, 7]).await;
	let room = service.create("Lab Room", UserId(42)).await.unwrap();

	service.delete(&room.room_id, UserId(42)).await.unwrap();

	assert!(matches!(service.join(&room.room_id, UserId(7)).await, Err(RoomError::NotFound)));
	assert!(matches!(service.exit(&room.room_id, UserId(42)).await, Err(RoomError::NotFound)));
	assert!(matches!(
		service.delete(&room.room_id, UserId(42)).await,
		Err(RoomError::NotFound)
	));
}

#[tokio::test]
async fn list_returns_member_rooms_newest_first() {
	let (service, store) = service_with_users(&[1]).await;

	for (id, created_at) in [("a", 1_000), ("c", 3_000), ("b", 2_000)] {
		let room = Room::new(
			RoomId::new(id).unwrap(),
			RoomName::new(format!("room {id}")).unwrap(),
			UserId(1),
			created_at,
		);
		store.create_room(&room).await.unwrap();
	}

	let listed = service.list_for_member(UserId(1)).await.unwrap();
	let ids: Vec<&str> = listed.iter().map(|r| r.room_id.as_str()).collect();
	assert_eq!(ids, vec!["c", "b", "a"]);
}

#[tokio::test]
async fn list_excludes_rooms_without_the_member() {
	let (service, _) = service_with_users(&[1, 2]).await;
	service.create("mine", UserId(1)).await.unwrap();
	let theirs = service.create("theirs", UserId(2)).await.unwrap();

	let listed = service.list_for_member(UserId(1)).await.unwrap();
	assert_eq!(listed.len(), 1);
	assert_ne!(listed[0].room_id, theirs.room_id);
}

#[tokio::test]
async fn concurrent_creates_yield_distinct_room_ids() {
	let (service, _) = service_with_users(&[42]).await;

	let mut set = tokio::task::JoinSet::new();
	for n in 0..16 {
		let service = Arc::clone(&service);
		set.spawn(async move { service.create(&format!("room {n}"), UserId(42)).await });
	}

	let mut ids = HashSet::new();
	while let Some(joined) = set.join_next().await {
		let room = joined.expect("task").expect("create");
		ids.insert(room.room_id.into_string());
	}

	assert_eq!(ids.len(), 16);
}

/// Store wrapper that reports a uniqueness conflict for the first N creates.
struct CollidingStore {
	inner: MemoryRoomStore,
	collisions_left: AtomicUsize,
}

impl CollidingStore {
	fn new(collisions: usize) -> Self {
		Self {
			inner: MemoryRoomStore::default(),
			collisions_left: AtomicUsize::new(collisions),
		}
	}
}

#[async_trait]
impl RoomStore for CollidingStore {
	async fn upsert_identity(&self, identity: &Identity) -> Result<(), StoreError> {
		self.inner.upsert_identity(identity).await
	}

	async fn find_identity(&self, id: UserId) -> Result<Option<Identity>, StoreError> {
		self.inner.find_identity(id).await
	}

	async fn create_room(&self, room: &Room) -> Result<(), StoreError> {
		if self
			.collisions_left
			.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
			.is_ok()
		{
			return Err(StoreError::DuplicateRoomId);
		}
		self.inner.create_room(room).await
	}

	async fn find_room(&self, room_id: &RoomId) -> Result<Option<Room>, StoreError> {
		self.inner.find_room(room_id).await
	}

	async fn add_member(&self, room_id: &RoomId, user: UserId) -> Result<Option<Room>, StoreError> {
		self.inner.add_member(room_id, user).await
	}

	async fn remove_member(&self, room_id: &RoomId, user: UserId) -> Result<Option<Room>, StoreError> {
		self.inner.remove_member(room_id, user).await
	}

	async fn delete_room(&self, room_id: &RoomId, created_by: UserId) -> Result<bool, StoreError> {
		self.inner.delete_room(room_id, created_by).await
	}

	async fn rooms_for_member(&self, user: UserId) -> Result<Vec<Room>, StoreError> {
		self.inner.rooms_for_member(user).await
	}
}

#[tokio::test]
async fn id_collisions_are_absorbed_by_bounded_retry() {
	let store = Arc::new(CollidingStore::new(2));
	store.upsert_identity(&identity(42, "Ada")).await.unwrap();

	let shared: Arc<dyn RoomStore> = store.clone();
	let service = RoomService::new(shared);
	let room = service.create("Lab Room", UserId(42)).await.unwrap();
	assert!(room.is_member(UserId(42)));
}

#[tokio::test]
async fn persistent_id_collisions_exhaust_the_retry_budget() {
	let store = Arc::new(CollidingStore::new(usize::MAX));
	store.upsert_identity(&identity(42, "Ada")).await.unwrap();

	let shared: Arc<dyn RoomStore> = store.clone();
	let service = RoomService::new(shared);
	assert!(matches!(
		service.create("Lab Room", UserId(42)).await,
		Err(RoomError::Storage(StoreError::DuplicateRoomId))
	));
}

#[tokio::test]
async fn example_scenario_end_to_end() {
	let (service, _) = service_with_users(&[42, 7]).await;

	let room = service.create("Lab Room", UserId(42)).await.unwrap();
	assert_eq!(room.members.iter().copied().collect::<Vec<_>>(), vec![UserId(42)]);

	let joined = service.join(&room.room_id, UserId(7)).await.unwrap();
	assert!(joined.is_member(UserId(42)) && joined.is_member(UserId(7)));

	assert!(matches!(
		service.delete(&room.room_id, UserId(7)).await,
		Err(RoomError::PermissionDenied)
	));

	service.delete(&room.room_id, UserId(42)).await.unwrap();
	assert!(matches!(service.join(&room.room_id, UserId(7)).await, Err(RoomError::NotFound)));
}
