#![forbid(unsafe_code)]

use std::collections::HashMap;

use anyhow::{Context as _, anyhow};
use async_trait::async_trait;
use parlor_domain::{Identity, Room, RoomId, RoomName, UserId};
use thiserror::Error;
use tokio::sync::Mutex;

/// Store-level failures the services translate into their own taxonomies.
#[derive(Debug, Error)]
pub enum StoreError {
	/// The unique `room_id` index rejected an insert.
	#[error("room id already exists")]
	DuplicateRoomId,

	/// Room creation referenced an owner with no identity record.
	#[error("owner {0} has no identity record")]
	UnknownOwner(UserId),

	/// Backend unavailable or failed mid-operation.
	#[error(transparent)]
	Backend(#[from] anyhow::Error),
}

/// Persistence boundary for identities and rooms.
///
/// Membership mutations are set-level conditional updates; implementations
/// must not read-modify-write whole room records, or concurrent writers
/// lose updates.
#[async_trait]
pub trait RoomStore: Send + Sync {
	/// Insert or replace the identity record keyed by `identity.id`
	/// (latest wins, all fields).
	async fn upsert_identity(&self, identity: &Identity) -> Result<(), StoreError>;

	async fn find_identity(&self, id: UserId) -> Result<Option<Identity>, StoreError>;

	/// Insert a new room. The owner-existence check, the room insert and the
	/// initial membership rows form one atomic unit: all become visible or
	/// none do.
	async fn create_room(&self, room: &Room) -> Result<(), StoreError>;

	async fn find_room(&self, room_id: &RoomId) -> Result<Option<Room>, StoreError>;

	/// Idempotent membership add. `None` when the room does not exist.
	async fn add_member(&self, room_id: &RoomId, user: UserId) -> Result<Option<Room>, StoreError>;

	/// Idempotent membership remove. `None` when the room does not exist.
	async fn remove_member(&self, room_id: &RoomId, user: UserId) -> Result<Option<Room>, StoreError>;

	/// Remove a room, conditional on `created_by` matching its creator.
	/// Returns whether a record was removed.
	async fn delete_room(&self, room_id: &RoomId, created_by: UserId) -> Result<bool, StoreError>;

	/// Snapshot of rooms containing `user`, newest first.
	async fn rooms_for_member(&self, user: UserId) -> Result<Vec<Room>, StoreError>;
}

/// In-memory store. One lock around all state makes every operation atomic,
/// including the create-room owner check.
#[derive(Default)]
pub struct MemoryRoomStore {
	inner: Mutex<MemoryInner>,
}

#[derive(Default)]
struct MemoryInner {
	identities: HashMap<UserId, Identity>,
	rooms: HashMap<RoomId, Room>,
}

#[async_trait]
impl RoomStore for MemoryRoomStore {
	async fn upsert_identity(&self, identity: &Identity) -> Result<(), StoreError> {
		let mut inner = self.inner.lock().await;
		inner.identities.insert(identity.id, identity.clone());
		Ok(())
	}

	async fn find_identity(&self, id: UserId) -> Result<Option<Identity>, StoreError> {
		let inner = self.inner.lock().await;
		Ok(inner.identities.get(&id).cloned())
	}

	async fn create_room(&self, room: &Room) -> Result<(), StoreError> {
		let mut inner = self.inner.lock().await;

		if !inner.identities.contains_key(&room.created_by) {
			return Err(StoreError::UnknownOwner(room.created_by));
		}
		if inner.rooms.contains_key(&room.room_id) {
			return Err(StoreError::DuplicateRoomId);
		}

		inner.rooms.insert(room.room_id.clone(), room.clone());
		Ok(())
	}

	async fn find_room(&self, room_id: &RoomId) -> Result<Option<Room>, StoreError> {
		let inner = self.inner.lock().await;
		Ok(inner.rooms.get(room_id).cloned())
	}

	async fn add_member(&self, room_id: &RoomId, user: UserId) -> Result<Option<Room>, StoreError> {
		let mut inner = self.inner.lock().await;
		match inner.rooms.get_mut(room_id) {
			Some(room) => {
				room.members.insert(user);
				Ok(Some(room.clone()))
			}
			None => Ok(None),
		}
	}

	async fn remove_member(&self, room_id: &RoomId, user: UserId) -> Result<Option<Room>, StoreError> {
		let mut inner = self.inner.lock().await;
		match inner.rooms.get_mut(room_id) {
			Some(room) => {
				room.members.remove(&user);
				Ok(Some(room.clone()))
			}
			None => Ok(None),
		}
	}

	async fn delete_room(&self, room_id: &RoomId, created_by: UserId) -> Result<bool, StoreError> {
		let mut inner = self.inner.lock().await;
		match inner.rooms.get(room_id) {
			Some(room) if room.created_by == created_by => {
				inner.rooms.remove(room_id);
				Ok(true)
			}
			_ => Ok(false),
		}
	}

	async fn rooms_for_member(&self, user: UserId) -> Result<Vec<Room>, StoreError> {
		let inner = self.inner.lock().await;
		let mut rooms: Vec<Room> = inner.rooms.values().filter(|r| r.is_member(user)).cloned().collect();
		rooms.sort_by(|a, b| {
			b.created_at
				.cmp(&a.created_at)
				.then_with(|| b.room_id.as_str().cmp(a.room_id.as_str()))
		});
		Ok(rooms)
	}
}

/// SQL-backed store; `sqlite:` and `postgres:` URLs are supported.
#[derive(Clone)]
pub struct SqlRoomStore {
	backend: SqlBackend,
}

#[derive(Clone)]
enum SqlBackend {
	Sqlite(sqlx::SqlitePool),
	Postgres(sqlx::PgPool),
}

impl SqlRoomStore {
	pub async fn connect(database_url: &str) -> anyhow::Result<Self> {
		if database_url.starts_with("sqlite:") {
			let pool = sqlx::SqlitePool::connect(database_url).await.context("connect sqlite")?;
			sqlx::migrate!("migrations/sqlite")
				.run(&pool)
				.await
				.context("run sqlite migrations")?;

			Ok(Self {
				backend: SqlBackend::Sqlite(pool),
			})
		} else if database_url.starts_with("postgres:") || database_url.starts_with("postgresql:") {
			let pool = sqlx::PgPool::connect(database_url).await.context("connect postgres")?;
			sqlx::migrate!("migrations/postgres")
				.run(&pool)
				.await
				.context("run postgres migrations")?;

			Ok(Self {
				backend: SqlBackend::Postgres(pool),
			})
		} else {
			Err(anyhow!("unsupported database_url (use sqlite: or postgres:)"))
		}
	}
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
	match err {
		sqlx::Error::Database(db) => db.is_unique_violation(),
		_ => false,
	}
}

fn room_from_rows(
	room_id: String,
	room_name: String,
	created_by: i64,
	created_at: i64,
	member_rows: Vec<(i64,)>,
) -> Result<Room, StoreError> {
	let room_id = RoomId::new(room_id).map_err(|e| StoreError::Backend(anyhow!("corrupt room_id: {e}")))?;
	let room_name = RoomName::new(room_name).map_err(|e| StoreError::Backend(anyhow!("corrupt room_name: {e}")))?;

	let mut room = Room::new(room_id, room_name, UserId(created_by), created_at);
	room.members = member_rows.into_iter().map(|(id,)| UserId(id)).collect();
	Ok(room)
}

#[async_trait]
impl RoomStore for SqlRoomStore {
	async fn upsert_identity(&self, identity: &Identity) -> Result<(), StoreError> {
		match &self.backend {
			SqlBackend::Sqlite(pool) => {
				sqlx::query(
					"INSERT INTO identities (user_id, first_name, last_name, username, language) VALUES (?, ?, ?, ?, ?) \
					ON CONFLICT(user_id) DO UPDATE SET first_name = excluded.first_name, \
					last_name = excluded.last_name, username = excluded.username, language = excluded.language",
				)
				.bind(identity.id.0)
				.bind(&identity.first_name)
				.bind(identity.last_name.as_deref())
				.bind(identity.username.as_deref())
				.bind(&identity.language)
				.execute(pool)
				.await
				.context("upsert identity (sqlite)")?;
			}
			SqlBackend::Postgres(pool) => {
				sqlx::query(
					"INSERT INTO identities (user_id, first_name, last_name, username, language) VALUES ($1, $2, $3, $4, $5) \
					ON CONFLICT (user_id) DO UPDATE SET first_name = EXCLUDED.first_name, \
					last_name = EXCLUDED.last_name, username = EXCLUDED.username, language = EXCLUDED.language",
				)
				.bind(identity.id.0)
				.bind(&identity.first_name)
				.bind(identity.last_name.as_deref())
				.bind(identity.username.as_deref())
				.bind(&identity.language)
				.execute(pool)
				.await
				.context("upsert identity (postgres)")?;
			}
		}

		Ok(())
	}

	async fn find_identity(&self, id: UserId) -> Result<Option<Identity>, StoreError> {
		let row: Option<(String, Option<String>, Option<String>, String)> = match &self.backend {
			SqlBackend::Sqlite(pool) => {
				sqlx::query_as("SELECT first_name, last_name, username, language FROM identities WHERE user_id = ?")
					.bind(id.0)
					.fetch_optional(pool)
					.await
					.context("select identity (sqlite)")?
			}
			SqlBackend::Postgres(pool) => {
				sqlx::query_as("SELECT first_name, last_name, username, language FROM identities WHERE user_id = $1")
					.bind(id.0)
					.fetch_optional(pool)
					.await
					.context("select identity (postgres)")?
			}
		};

		Ok(row.map(|(first_name, last_name, username, language)| Identity {
			id,
			first_name,
			last_name,
			username,
			language,
		}))
	}

	async fn create_room(&self, room: &Room) -> Result<(), StoreError> {
		match &self.backend {
			SqlBackend::Sqlite(pool) => {
				let mut tx = pool.begin().await.context("begin sqlite tx")?;

				let owner: Option<(i64,)> = sqlx::query_as("SELECT user_id FROM identities WHERE user_id = ?")
					.bind(room.created_by.0)
					.fetch_optional(&mut *tx)
					.await
					.context("select owner (sqlite)")?;
				if owner.is_none() {
					return Err(StoreError::UnknownOwner(room.created_by));
				}

				let inserted = sqlx::query("INSERT INTO rooms (room_id, room_name, created_by, created_at) VALUES (?, ?, ?, ?)")
					.bind(room.room_id.as_str())
					.bind(room.room_name.as_str())
					.bind(room.created_by.0)
					.bind(room.created_at)
					.execute(&mut *tx)
					.await;
				match inserted {
					Ok(_) => {}
					Err(e) if is_unique_violation(&e) => return Err(StoreError::DuplicateRoomId),
					Err(e) => return Err(StoreError::Backend(anyhow!(e).context("insert room (sqlite)"))),
				}

				for member in &room.members {
					sqlx::query("INSERT INTO room_members (room_id, user_id) VALUES (?, ?) ON CONFLICT(room_id, user_id) DO NOTHING")
						.bind(room.room_id.as_str())
						.bind(member.0)
						.execute(&mut *tx)
						.await
						.context("insert room member (sqlite)")?;
				}

				tx.commit().await.context("commit sqlite tx")?;
			}
			SqlBackend::Postgres(pool) => {
				let mut tx = pool.begin().await.context("begin postgres tx")?;

				let owner: Option<(i64,)> = sqlx::query_as("SELECT user_id FROM identities WHERE user_id = $1")
					.bind(room.created_by.0)
					.fetch_optional(&mut *tx)
					.await
					.context("select owner (postgres)")?;
				if owner.is_none() {
					return Err(StoreError::UnknownOwner(room.created_by));
				}

				let inserted =
					sqlx::query("INSERT INTO rooms (room_id, room_name, created_by, created_at) VALUES ($1, $2, $3, $4)")
						.bind(room.room_id.as_str())
						.bind(room.room_name.as_str())
						.bind(room.created_by.0)
						.bind(room.created_at)
						.execute(&mut *tx)
						.await;
				match inserted {
					Ok(_) => {}
					Err(e) if is_unique_violation(&e) => return Err(StoreError::DuplicateRoomId),
					Err(e) => return Err(StoreError::Backend(anyhow!(e).context("insert room (postgres)"))),
				}

				for member in &room.members {
					sqlx::query("INSERT INTO room_members (room_id, user_id) VALUES ($1, $2) ON CONFLICT (room_id, user_id) DO NOTHING")
						.bind(room.room_id.as_str())
						.bind(member.0)
						.execute(&mut *tx)
						.await
						.context("insert room member (postgres)")?;
				}

				tx.commit().await.context("commit postgres tx")?;
			}
		}

		Ok(())
	}

	async fn find_room(&self, room_id: &RoomId) -> Result<Option<Room>, StoreError> {
		match &self.backend {
			SqlBackend::Sqlite(pool) => {
				let row: Option<(String, String, i64, i64)> = sqlx::query_as(
					"SELECT room_id, room_name, created_by, created_at FROM rooms WHERE room_id = ?",
				)
				.bind(room_id.as_str())
				.fetch_optional(pool)
				.await
				.context("select room (sqlite)")?;
				let Some((id, name, created_by, created_at)) = row else {
					return Ok(None);
				};

				let members: Vec<(i64,)> = sqlx::query_as("SELECT user_id FROM room_members WHERE room_id = ?")
					.bind(room_id.as_str())
					.fetch_all(pool)
					.await
					.context("select room members (sqlite)")?;

				Ok(Some(room_from_rows(id, name, created_by, created_at, members)?))
			}
			SqlBackend::Postgres(pool) => {
				let row: Option<(String, String, i64, i64)> = sqlx::query_as(
					"SELECT room_id, room_name, created_by, created_at FROM rooms WHERE room_id = $1",
				)
				.bind(room_id.as_str())
				.fetch_optional(pool)
				.await
				.context("select room (postgres)")?;
				let Some((id, name, created_by, created_at)) = row else {
					return Ok(None);
				};

				let members: Vec<(i64,)> = sqlx::query_as("SELECT user_id FROM room_members WHERE room_id = $1")
					.bind(room_id.as_str())
					.fetch_all(pool)
					.await
					.context("select room members (postgres)")?;

				Ok(Some(room_from_rows(id, name, created_by, created_at, members)?))
			}
		}
	}

	async fn add_member(&self, room_id: &RoomId, user: UserId) -> Result<Option<Room>, StoreError> {
		match &self.backend {
			SqlBackend::Sqlite(pool) => {
				let mut tx = pool.begin().await.context("begin sqlite tx")?;

				let row: Option<(String, String, i64, i64)> = sqlx::query_as(
					"SELECT room_id, room_name, created_by, created_at FROM rooms WHERE room_id = ?",
				)
				.bind(room_id.as_str())
				.fetch_optional(&mut *tx)
				.await
				.context("select room (sqlite)")?;
				let Some((id, name, created_by, created_at)) = row else {
					return Ok(None);
				};

				sqlx::query("INSERT INTO room_members (room_id, user_id) VALUES (?, ?) ON CONFLICT(room_id, user_id) DO NOTHING")
					.bind(room_id.as_str())
					.bind(user.0)
					.execute(&mut *tx)
					.await
					.context("add room member (sqlite)")?;

				let members: Vec<(i64,)> = sqlx::query_as("SELECT user_id FROM room_members WHERE room_id = ?")
					.bind(room_id.as_str())
					.fetch_all(&mut *tx)
					.await
					.context("select room members (sqlite)")?;

				tx.commit().await.context("commit sqlite tx")?;
				Ok(Some(room_from_rows(id, name, created_by, created_at, members)?))
			}
			SqlBackend::Postgres(pool) => {
				let mut tx = pool.begin().await.context("begin postgres tx")?;

				let row: Option<(String, String, i64, i64)> = sqlx::query_as(
					"SELECT room_id, room_name, created_by, created_at FROM rooms WHERE room_id = $1",
				)
				.bind(room_id.as_str())
				.fetch_optional(&mut *tx)
				.await
				.context("select room (postgres)")?;
				let Some((id, name, created_by, created_at)) = row else {
					return Ok(None);
				};

				sqlx::query("INSERT INTO room_members (room_id, user_id) VALUES ($1, $2) ON CONFLICT (room_id, user_id) DO NOTHING")
					.bind(room_id.as_str())
					.bind(user.0)
					.execute(&mut *tx)
					.await
					.context("add room member (postgres)")?;

				let members: Vec<(i64,)> = sqlx::query_as("SELECT user_id FROM room_members WHERE room_id = $1")
					.bind(room_id.as_str())
					.fetch_all(&mut *tx)
					.await
					.context("select room members (postgres)")?;

				tx.commit().await.context("commit postgres tx")?;
				Ok(Some(room_from_rows(id, name, created_by, created_at, members)?))
			}
		}
	}

	async fn remove_member(&self, room_id: &RoomId, user: UserId) -> Result<Option<Room>, StoreError> {
		match &self.backend {
			SqlBackend::Sqlite(pool) => {
				let mut tx = pool.begin().await.context("begin sqlite tx")?;

				let row: Option<(String, String, i64, i64)> = sqlx::query_as(
					"SELECT room_id, room_name, created_by, created_at FROM rooms WHERE room_id = ?",
				)
				.bind(room_id.as_str())
				.fetch_optional(&mut *tx)
				.await
				.context("select room (sqlite)")?;
				let Some((id, name, created_by, created_at)) = row else {
					return Ok(None);
				};

				sqlx::query("DELETE FROM room_members WHERE room_id = ? AND user_id = ?")
					.bind(room_id.as_str())
					.bind(user.0)
					.execute(&mut *tx)
					.await
					.context("remove room member (sqlite)")?;

				let members: Vec<(i64,)> = sqlx::query_as("SELECT user_id FROM room_members WHERE room_id = ?")
					.bind(room_id.as_str())
					.fetch_all(&mut *tx)
					.await
					.context("select room members (sqlite)")?;

				tx.commit().await.context("commit sqlite tx")?;
				Ok(Some(room_from_rows(id, name, created_by, created_at, members)?))
			}
			SqlBackend::Postgres(pool) => {
				let mut tx = pool.begin().await.context("begin postgres tx")?;

				let row: Option<(String, String, i64, i64)> = sqlx::query_as(
					"SELECT room_id, room_name, created_by, created_at FROM rooms WHERE room_id = $1",
				)
				.bind(room_id.as_str())
				.fetch_optional(&mut *tx)
				.await
				.context("select room (postgres)")?;
				let Some((id, name, created_by, created_at)) = row else {
					return Ok(None);
				};

				sqlx::query("DELETE FROM room_members WHERE room_id = $1 AND user_id = $2")
					.bind(room_id.as_str())
					.bind(user.0)
					.execute(&mut *tx)
					.await
					.context("remove room member (postgres)")?;

				let members: Vec<(i64,)> = sqlx::query_as("SELECT user_id FROM room_members WHERE room_id = $1")
					.bind(room_id.as_str())
					.fetch_all(&mut *tx)
					.await
					.context("select room members (postgres)")?;

				tx.commit().await.context("commit postgres tx")?;
				Ok(Some(room_from_rows(id, name, created_by, created_at, members)?))
			}
		}
	}

	async fn delete_room(&self, room_id: &RoomId, created_by: UserId) -> Result<bool, StoreError> {
		match &self.backend {
			SqlBackend::Sqlite(pool) => {
				let mut tx = pool.begin().await.context("begin sqlite tx")?;

				let deleted = sqlx::query("DELETE FROM rooms WHERE room_id = ? AND created_by = ?")
					.bind(room_id.as_str())
					.bind(created_by.0)
					.execute(&mut *tx)
					.await
					.context("delete room (sqlite)")?;
				if deleted.rows_affected() == 0 {
					return Ok(false);
				}

				sqlx::query("DELETE FROM room_members WHERE room_id = ?")
					.bind(room_id.as_str())
					.execute(&mut *tx)
					.await
					.context("delete room members (sqlite)")?;

				tx.commit().await.context("commit sqlite tx")?;
				Ok(true)
			}
			SqlBackend::Postgres(pool) => {
				let mut tx = pool.begin().await.context("begin postgres tx")?;

				let deleted = sqlx::query("DELETE FROM rooms WHERE room_id = $1 AND created_by = $2")
					.bind(room_id.as_str())
					.bind(created_by.0)
					.execute(&mut *tx)
					.await
					.context("delete room (postgres)")?;
				if deleted.rows_affected() == 0 {
					return Ok(false);
				}

				sqlx::query("DELETE FROM room_members WHERE room_id = $1")
					.bind(room_id.as_str())
					.execute(&mut *tx)
					.await
					.context("delete room members (postgres)")?;

				tx.commit().await.context("commit postgres tx")?;
				Ok(true)
			}
		}
	}

	async fn rooms_for_member(&self, user: UserId) -> Result<Vec<Room>, StoreError> {
		let rows: Vec<(String, String, i64, i64)> = match &self.backend {
			SqlBackend::Sqlite(pool) => sqlx::query_as(
				"SELECT r.room_id, r.room_name, r.created_by, r.created_at FROM rooms r \
				JOIN room_members m ON m.room_id = r.room_id \
				WHERE m.user_id = ? ORDER BY r.created_at DESC, r.room_id DESC",
			)
			.bind(user.0)
			.fetch_all(pool)
			.await
			.context("select rooms for member (sqlite)")?,
			SqlBackend::Postgres(pool) => sqlx::query_as(
				"SELECT r.room_id, r.room_name, r.created_by, r.created_at FROM rooms r \
				JOIN room_members m ON m.room_id = r.room_id \
				WHERE m.user_id = $1 ORDER BY r.created_at DESC, r.room_id DESC",
			)
			.bind(user.0)
			.fetch_all(pool)
			.await
			.context("select rooms for member (postgres)")?,
		};

		let mut rooms = Vec::with_capacity(rows.len());
		for (id, name, created_by, created_at) in rows {
			let members: Vec<(i64,)> = match &self.backend {
				SqlBackend::Sqlite(pool) => sqlx::query_as("SELECT user_id FROM room_members WHERE room_id = ?")
					.bind(&id)
					.fetch_all(pool)
					.await
					.context("select room members (sqlite)")?,
				SqlBackend::Postgres(pool) => sqlx::query_as("SELECT user_id FROM room_members WHERE room_id = $1")
					.bind(&id)
					.fetch_all(pool)
					.await
					.context("select room members (postgres)")?,
			};
			rooms.push(room_from_rows(id, name, created_by, created_at, members)?);
		}

		Ok(rooms)
	}
}
