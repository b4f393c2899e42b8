#![forbid(unsafe_code)]

use std::collections::HashMap;

use anyhow::{Context as _, anyhow};
use async_trait::async_trait;
use plaza_domain::{DisplayName, Identity, IdentityId, Position, Skin};
use tokio::sync::Mutex;
use tracing::info;

/// Durable identity storage. `Ok(None)` means the identity does not exist.
#[async_trait]
pub trait IdentityRepository: Send + Sync {
	async fn get_identity(&self, id: IdentityId) -> anyhow::Result<Option<Identity>>;

	async fn get_by_account(&self, account: &str) -> anyhow::Result<Option<Identity>>;

	/// Fails when the account already exists.
	async fn create_identity(&self, account: &str, display_name: DisplayName) -> anyhow::Result<Identity>;

	async fn update_name(&self, id: IdentityId, name: &DisplayName) -> anyhow::Result<Option<Identity>>;

	async fn update_skin(&self, id: IdentityId, skin: Skin) -> anyhow::Result<Option<Identity>>;

	async fn update_position(&self, id: IdentityId, position: Position) -> anyhow::Result<Option<Identity>>;

	async fn touch_last_seen(&self, id: IdentityId, at_unix_ms: i64) -> anyhow::Result<Option<Identity>>;
}

fn new_identity(account: &str, display_name: DisplayName) -> Identity {
	Identity {
		id: IdentityId::new_v4(),
		account: account.to_string(),
		display_name,
		skin: Skin::default(),
		position: Position::ORIGIN,
		last_seen_unix_ms: 0,
	}
}

/// Process-local repository. Used when no database is configured.
#[derive(Default)]
pub struct InMemoryIdentityRepository {
	identities: Mutex<HashMap<IdentityId, Identity>>,
}

impl InMemoryIdentityRepository {
	pub fn new() -> Self {
		Self::default()
	}

	/// Insert or replace an identity.
	pub async fn insert(&self, identity: Identity) {
		self.identities.lock().await.insert(identity.id, identity);
	}

	async fn update(&self, id: IdentityId, apply: impl FnOnce(&mut Identity)) -> Option<Identity> {
		let mut identities = self.identities.lock().await;
		let identity = identities.get_mut(&id)?;
		apply(identity);
		Some(identity.clone())
	}
}

#[async_trait]
impl IdentityRepository for InMemoryIdentityRepository {
	async fn get_identity(&self, id: IdentityId) -> anyhow::Result<Option<Identity>> {
		Ok(self.identities.lock().await.get(&id).cloned())
	}

	async fn get_by_account(&self, account: &str) -> anyhow::Result<Option<Identity>> {
		Ok(self
			.identities
			.lock()
			.await
			.values()
			.find(|identity| identity.account == account)
			.cloned())
	}

	async fn create_identity(&self, account: &str, display_name: DisplayName) -> anyhow::Result<Identity> {
		let mut identities = self.identities.lock().await;
		if identities.values().any(|identity| identity.account == account) {
			return Err(anyhow!("account already exists: {account}"));
		}
		let identity = new_identity(account, display_name);
		identities.insert(identity.id, identity.clone());
		Ok(identity)
	}

	async fn update_name(&self, id: IdentityId, name: &DisplayName) -> anyhow::Result<Option<Identity>> {
		Ok(self.update(id, |identity| identity.display_name = name.clone()).await)
	}

	async fn update_skin(&self, id: IdentityId, skin: Skin) -> anyhow::Result<Option<Identity>> {
		Ok(self.update(id, |identity| identity.skin = skin).await)
	}

	async fn update_position(&self, id: IdentityId, position: Position) -> anyhow::Result<Option<Identity>> {
		Ok(self.update(id, |identity| identity.position = position).await)
	}

	async fn touch_last_seen(&self, id: IdentityId, at_unix_ms: i64) -> anyhow::Result<Option<Identity>> {
		Ok(self.update(id, |identity| identity.last_seen_unix_ms = at_unix_ms).await)
	}
}

type IdentityRow = (String, String, String, i64, f64, f64, i64);

fn row_to_identity(row: IdentityRow) -> anyhow::Result<Identity> {
	let (id, account, display_name, skin, x, y, last_seen_unix_ms) = row;
	Ok(Identity {
		id: id.parse().map_err(|e| anyhow!("stored identity id {id:?}: {e}"))?,
		account,
		display_name: DisplayName::new(display_name).context("stored display name")?,
		skin: u32::try_from(skin)
			.map_err(|e| anyhow!("stored skin {skin}: {e}"))
			.and_then(|code| Skin::new(code).context("stored skin"))?,
		position: Position { x: x as f32, y: y as f32 },
		last_seen_unix_ms,
	})
}

#[derive(Clone)]
enum SqlBackend {
	Sqlite(sqlx::SqlitePool),
	Postgres(sqlx::PgPool),
	Mysql(sqlx::MySqlPool),
}

impl SqlBackend {
	fn name(&self) -> &'static str {
		match self {
			SqlBackend::Sqlite(_) => "sqlite",
			SqlBackend::Postgres(_) => "postgres",
			SqlBackend::Mysql(_) => "mysql",
		}
	}
}

enum SqlValue {
	Text(String),
	Int(i64),
}

/// sqlx-backed repository; the backend is picked from the URL scheme.
#[derive(Clone)]
pub struct SqlIdentityRepository {
	backend: SqlBackend,
}

const SELECT_COLUMNS: &str = "id, account, display_name, skin, pos_x, pos_y, last_seen_unix_ms";

impl SqlIdentityRepository {
	pub async fn connect(database_url: &str) -> anyhow::Result<Self> {
		let backend = if database_url.starts_with("sqlite:") {
			// Each in-memory connection is its own database; keep exactly one.
			let max_connections = if database_url.contains(":memory:") { 1 } else { 8 };
			let pool = sqlx::sqlite::SqlitePoolOptions::new()
				.max_connections(max_connections)
				.connect(database_url)
				.await
				.context("connect sqlite")?;
			sqlx::migrate!("migrations/sqlite")
				.run(&pool)
				.await
				.context("run sqlite migrations")?;
			SqlBackend::Sqlite(pool)
		} else if database_url.starts_with("postgres:") || database_url.starts_with("postgresql:") {
			let pool = sqlx::PgPool::connect(database_url).await.context("connect postgres")?;
			sqlx::migrate!("migrations/postgres")
				.run(&pool)
				.await
				.context("run postgres migrations")?;
			SqlBackend::Postgres(pool)
		} else if database_url.starts_with("mysql:") || database_url.starts_with("mariadb:") {
			let pool = sqlx::MySqlPool::connect(database_url).await.context("connect mysql")?;
			sqlx::migrate!("migrations/mysql")
				.run(&pool)
				.await
				.context("run mysql migrations")?;
			SqlBackend::Mysql(pool)
		} else {
			return Err(anyhow!("unsupported database_url (use sqlite:, postgres:, mysql:)"));
		};

		info!(backend = backend.name(), "identity repository connected");
		Ok(Self { backend })
	}

	async fn fetch_where(&self, column: &str, value: &str) -> anyhow::Result<Option<Identity>> {
		let row: Option<IdentityRow> = match &self.backend {
			SqlBackend::Sqlite(pool) => {
				let sql = format!("SELECT {SELECT_COLUMNS} FROM identities WHERE {column} = ?");
				sqlx::query_as(&sql).bind(value).fetch_optional(pool).await
			}
			SqlBackend::Postgres(pool) => {
				let sql = format!("SELECT {SELECT_COLUMNS} FROM identities WHERE {column} = $1");
				sqlx::query_as(&sql).bind(value).fetch_optional(pool).await
			}
			SqlBackend::Mysql(pool) => {
				let sql = format!("SELECT {SELECT_COLUMNS} FROM identities WHERE {column} = ?");
				sqlx::query_as(&sql).bind(value).fetch_optional(pool).await
			}
		}
		.with_context(|| format!("select identity by {column} ({})", self.backend.name()))?;

		row.map(row_to_identity).transpose()
	}

	/// `UPDATE identities SET <column> = <value> WHERE id = <id>`, then reload the row.
	async fn update_column(&self, id: IdentityId, column: &str, value: SqlValue) -> anyhow::Result<Option<Identity>> {
		let id_s = id.to_string();
		let affected = match &self.backend {
			SqlBackend::Sqlite(pool) => {
				let sql = format!("UPDATE identities SET {column} = ? WHERE id = ?");
				let query = match value {
					SqlValue::Text(v) => sqlx::query(&sql).bind(v),
					SqlValue::Int(v) => sqlx::query(&sql).bind(v),
				};
				query.bind(&id_s).execute(pool).await.map(|r| r.rows_affected())
			}
			SqlBackend::Postgres(pool) => {
				let sql = format!("UPDATE identities SET {column} = $1 WHERE id = $2");
				let query = match value {
					SqlValue::Text(v) => sqlx::query(&sql).bind(v),
					SqlValue::Int(v) => sqlx::query(&sql).bind(v),
				};
				query.bind(&id_s).execute(pool).await.map(|r| r.rows_affected())
			}
			SqlBackend::Mysql(pool) => {
				let sql = format!("UPDATE identities SET {column} = ? WHERE id = ?");
				let query = match value {
					SqlValue::Text(v) => sqlx::query(&sql).bind(v),
					SqlValue::Int(v) => sqlx::query(&sql).bind(v),
				};
				query.bind(&id_s).execute(pool).await.map(|r| r.rows_affected())
			}
		}
		.with_context(|| format!("update identity {column} ({})", self.backend.name()))?;

		// MySQL reports zero affected rows when the value is unchanged, so always reload.
		if affected == 0 && !matches!(self.backend, SqlBackend::Mysql(_)) {
			return Ok(None);
		}
		self.fetch_where("id", &id_s).await
	}
}

#[async_trait]
impl IdentityRepository for SqlIdentityRepository {
	async fn get_identity(&self, id: IdentityId) -> anyhow::Result<Option<Identity>> {
		self.fetch_where("id", &id.to_string()).await
	}

	async fn get_by_account(&self, account: &str) -> anyhow::Result<Option<Identity>> {
		self.fetch_where("account", account).await
	}

	async fn create_identity(&self, account: &str, display_name: DisplayName) -> anyhow::Result<Identity> {
		let identity = new_identity(account, display_name);
		let id_s = identity.id.to_string();
		let skin = i64::from(identity.skin.get());
		let (x, y) = (f64::from(identity.position.x), f64::from(identity.position.y));

		let sql = match &self.backend {
			SqlBackend::Postgres(_) => {
				"INSERT INTO identities (id, account, display_name, skin, pos_x, pos_y, last_seen_unix_ms) \
				VALUES ($1, $2, $3, $4, $5, $6, $7)"
			}
			SqlBackend::Sqlite(_) | SqlBackend::Mysql(_) => {
				"INSERT INTO identities (id, account, display_name, skin, pos_x, pos_y, last_seen_unix_ms) \
				VALUES (?, ?, ?, ?, ?, ?, ?)"
			}
		};

		match &self.backend {
			SqlBackend::Sqlite(pool) => {
				sqlx::query(sql)
					.bind(&id_s)
					.bind(&identity.account)
					.bind(identity.display_name.as_str())
					.bind(skin)
					.bind(x)
					.bind(y)
					.bind(identity.last_seen_unix_ms)
					.execute(pool)
					.await
					.map(|_| ())
			}
			SqlBackend::Postgres(pool) => {
				sqlx::query(sql)
					.bind(&id_s)
					.bind(&identity.account)
					.bind(identity.display_name.as_str())
					.bind(skin)
					.bind(x)
					.bind(y)
					.bind(identity.last_seen_unix_ms)
					.execute(pool)
					.await
					.map(|_| ())
			}
			SqlBackend::Mysql(pool) => {
				sqlx::query(sql)
					.bind(&id_s)
					.bind(&identity.account)
					.bind(identity.display_name.as_str())
					.bind(skin)
					.bind(x)
					.bind(y)
					.bind(identity.last_seen_unix_ms)
					.execute(pool)
					.await
					.map(|_| ())
			}
		}
		.with_context(|| format!("insert identity for account {account}"))?;

		Ok(identity)
	}

	async fn update_name(&self, id: IdentityId, name: &DisplayName) -> anyhow::Result<Option<Identity>> {
		self.update_column(id, "display_name", SqlValue::Text(name.as_str().to_string()))
			.await
	}

	async fn update_skin(&self, id: IdentityId, skin: Skin) -> anyhow::Result<Option<Identity>> {
		self.update_column(id, "skin", SqlValue::Int(i64::from(skin.get()))).await
	}

	async fn update_position(&self, id: IdentityId, position: Position) -> anyhow::Result<Option<Identity>> {
		let id_s = id.to_string();
		let (x, y) = (f64::from(position.x), f64::from(position.y));
		let affected = match &self.backend {
			SqlBackend::Sqlite(pool) => sqlx::query("UPDATE identities SET pos_x = ?, pos_y = ? WHERE id = ?")
				.bind(x)
				.bind(y)
				.bind(&id_s)
				.execute(pool)
				.await
				.map(|r| r.rows_affected()),
			SqlBackend::Postgres(pool) => sqlx::query("UPDATE identities SET pos_x = $1, pos_y = $2 WHERE id = $3")
				.bind(x)
				.bind(y)
				.bind(&id_s)
				.execute(pool)
				.await
				.map(|r| r.rows_affected()),
			SqlBackend::Mysql(pool) => sqlx::query("UPDATE identities SET pos_x = ?, pos_y = ? WHERE id = ?")
				.bind(x)
				.bind(y)
				.bind(&id_s)
				.execute(pool)
				.await
				.map(|r| r.rows_affected()),
		}
		.context("update identity position")?;

		if affected == 0 && !matches!(self.backend, SqlBackend::Mysql(_)) {
			return Ok(None);
		}
		self.fetch_where("id", &id_s).await
	}

	async fn touch_last_seen(&self, id: IdentityId, at_unix_ms: i64) -> anyhow::Result<Option<Identity>> {
		self.update_column(id, "last_seen_unix_ms", SqlValue::Int(at_unix_ms)).await
	}
}
