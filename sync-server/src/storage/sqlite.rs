//! SQLite storage backend for sync-server.

use super::{unix_now, DeviceState, LoggedOperation, OperationStore, StoreStats};
use crate::error::StorageError;
use async_trait::async_trait;
use sqlx::sqlite::{
    Sqlite, SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions,
    SqliteSynchronous,
};
use sqlx::QueryBuilder;
use std::collections::HashMap;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use sync_types::{DeviceToken, GroupId, Operation, OperationType, RelatedEntity, Tick, UserId};

/// Bound parameters per entity lookup; well under SQLite's variable limit.
const ENTITY_CHUNK: usize = 500;

const OPERATION_COLUMNS: &str =
    "id, device_token, group_id, operation_type, statement, arguments, created_at, recorded_at";

/// SQLite-based operation log.
///
/// Uses WAL mode for concurrent reads/writes.
#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Open (or create) the database at `path`.
    pub async fn new(path: &Path) -> Result<Self, StorageError> {
        if path.as_os_str().is_empty() {
            return Err(StorageError::InvalidPath {
                path: path.to_path_buf(),
            });
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .foreign_keys(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(10)
            .connect_with(options)
            .await?;

        let store = Self { pool };
        store.run_migrations().await?;
        Ok(store)
    }

    /// Create an in-memory store (for testing).
    pub async fn in_memory() -> Result<Self, StorageError> {
        let options = SqliteConnectOptions::from_str(":memory:")?.foreign_keys(true);

        // A second connection would open a second, empty database.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;

        let store = Self { pool };
        store.run_migrations().await?;
        Ok(store)
    }

    async fn run_migrations(&self) -> Result<(), StorageError> {
        const SCHEMA: &[&str] = &[
            r#"
            CREATE TABLE IF NOT EXISTS sync_clock (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                tick INTEGER NOT NULL
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS device_tokens (
                device_token TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                group_id TEXT NOT NULL,
                last_sync INTEGER NOT NULL DEFAULT 0
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS operations (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                device_token TEXT NOT NULL,
                group_id TEXT NOT NULL,
                operation_type TEXT NOT NULL,
                statement TEXT NOT NULL,
                arguments TEXT,
                tombstone INTEGER NOT NULL DEFAULT 0,
                created_at INTEGER NOT NULL,
                recorded_at INTEGER NOT NULL
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS related_entities (
                operation_id INTEGER NOT NULL REFERENCES operations(id) ON DELETE CASCADE,
                entity_id TEXT NOT NULL,
                entity_name TEXT NOT NULL,
                PRIMARY KEY (operation_id, entity_id, entity_name)
            )
            "#,
            "CREATE INDEX IF NOT EXISTS idx_device_tokens_group ON device_tokens(group_id)",
            "CREATE INDEX IF NOT EXISTS idx_operations_group_created ON operations(group_id, created_at)",
            "CREATE INDEX IF NOT EXISTS idx_operations_type_group_id ON operations(operation_type, group_id, id)",
            "CREATE INDEX IF NOT EXISTS idx_related_entities_entity ON related_entities(entity_name, entity_id)",
        ];

        for statement in SCHEMA {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .map_err(|e| StorageError::Migration(e.to_string()))?;
        }
        Ok(())
    }

    /// Load related entities for the given operation ids.
    async fn load_entities(
        &self,
        ids: &[i64],
    ) -> Result<HashMap<i64, Vec<RelatedEntity>>, StorageError> {
        let mut entities: HashMap<i64, Vec<RelatedEntity>> = HashMap::new();

        for chunk in ids.chunks(ENTITY_CHUNK) {
            let mut builder = QueryBuilder::<Sqlite>::new(
                "SELECT operation_id, entity_id, entity_name FROM related_entities WHERE operation_id IN (",
            );
            let mut separated = builder.separated(", ");
            for id in chunk {
                separated.push_bind(*id);
            }
            separated.push_unseparated(") ORDER BY operation_id, rowid");

            let rows: Vec<EntityRow> = builder.build_query_as().fetch_all(&self.pool).await?;
            for row in rows {
                entities
                    .entry(row.operation_id)
                    .or_default()
                    .push(RelatedEntity::new(row.entity_id, row.entity_name));
            }
        }

        Ok(entities)
    }

    /// Attach entities to operation rows.
    async fn hydrate(&self, rows: Vec<OperationRow>) -> Result<Vec<LoggedOperation>, StorageError> {
        let ids: Vec<i64> = rows.iter().map(|row| row.id).collect();
        let mut entities = self.load_entities(&ids).await?;

        rows.into_iter()
            .map(|row| {
                let related = entities.remove(&row.id).unwrap_or_default();
                row.into_logged(related)
            })
            .collect()
    }
}

/// Draw the next logical tick.
async fn next_tick<'e, E>(executor: E) -> Result<Tick, StorageError>
where
    E: sqlx::Executor<'e, Database = Sqlite>,
{
    let tick: i64 = sqlx::query_scalar(
        r#"
        INSERT INTO sync_clock (id, tick) VALUES (1, 1)
        ON CONFLICT(id) DO UPDATE SET tick = tick + 1
        RETURNING tick
        "#,
    )
    .fetch_one(executor)
    .await?;

    Ok(Tick::new(tick as u64))
}

#[async_trait]
impl OperationStore for SqliteStore {
    async fn resolve_group(
        &self,
        device: &DeviceToken,
        user: &UserId,
    ) -> Result<GroupId, StorageError> {
        let group: Option<String> =
            sqlx::query_scalar("SELECT group_id FROM device_tokens WHERE device_token = ?1")
                .bind(device.as_str())
                .fetch_optional(&self.pool)
                .await?;

        Ok(group.map(GroupId::from).unwrap_or_else(|| GroupId::own(user)))
    }

    async fn record_operations(
        &self,
        device: &DeviceToken,
        group: &GroupId,
        operations: &[Operation],
    ) -> Result<u64, StorageError> {
        if operations.is_empty() {
            return Ok(0);
        }

        let recorded_at = unix_now();
        let mut tx = self.pool.begin().await?;
        let tick = next_tick(&mut *tx).await?;

        for op in operations {
            let id: i64 = sqlx::query_scalar(
                r#"
                INSERT INTO operations
                    (device_token, group_id, operation_type, statement, arguments, tombstone, created_at, recorded_at)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                RETURNING id
                "#,
            )
            .bind(device.as_str())
            .bind(group.as_str())
            .bind(op.kind.as_str())
            .bind(&op.statement)
            .bind(op.arguments.as_deref())
            .bind(op.is_tombstone())
            .bind(tick.value() as i64)
            .bind(recorded_at)
            .fetch_one(&mut *tx)
            .await?;

            for entity in &op.related_entities {
                sqlx::query(
                    r#"
                    INSERT OR IGNORE INTO related_entities (operation_id, entity_id, entity_name)
                    VALUES (?1, ?2, ?3)
                    "#,
                )
                .bind(id)
                .bind(&entity.id)
                .bind(&entity.name)
                .execute(&mut *tx)
                .await?;
            }
        }

        tx.commit().await?;
        Ok(operations.len() as u64)
    }

    async fn compact_conflicts(
        &self,
        device: &DeviceToken,
        group: &GroupId,
    ) -> Result<u64, StorageError> {
        let result = sqlx::query(
            r#"
            DELETE FROM operations
            WHERE group_id = ?1
              AND created_at > COALESCE(
                  (SELECT last_sync FROM device_tokens WHERE device_token = ?2), 0)
              AND EXISTS (
                  SELECT 1
                  FROM related_entities mine
                  JOIN related_entities theirs
                    ON theirs.entity_id = mine.entity_id
                   AND theirs.entity_name = mine.entity_name
                  JOIN operations del ON del.id = theirs.operation_id
                  WHERE mine.operation_id = operations.id
                    AND del.operation_type = 'DELETE'
                    AND del.group_id = ?1
                    AND del.id > operations.id
              )
            "#,
        )
        .bind(group.as_str())
        .bind(device.as_str())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    async fn fetch_unsynced(
        &self,
        device: &DeviceToken,
        group: &GroupId,
    ) -> Result<Vec<LoggedOperation>, StorageError> {
        let rows = sqlx::query_as::<_, OperationRow>(&format!(
            r#"
            SELECT {OPERATION_COLUMNS}
            FROM operations
            WHERE group_id = ?1
              AND device_token != ?2
              AND tombstone = 0
              AND created_at > COALESCE(
                  (SELECT last_sync FROM device_tokens WHERE device_token = ?2), 0)
            ORDER BY id ASC
            "#
        ))
        .bind(group.as_str())
        .bind(device.as_str())
        .fetch_all(&self.pool)
        .await?;

        self.hydrate(rows).await
    }

    async fn fetch_all(&self, group: &GroupId) -> Result<Vec<LoggedOperation>, StorageError> {
        let rows = sqlx::query_as::<_, OperationRow>(&format!(
            r#"
            SELECT {OPERATION_COLUMNS}
            FROM operations
            WHERE group_id = ?1 AND tombstone = 0
            ORDER BY id ASC
            "#
        ))
        .bind(group.as_str())
        .fetch_all(&self.pool)
        .await?;

        self.hydrate(rows).await
    }

    async fn reassign_group(
        &self,
        device: &DeviceToken,
        user: &UserId,
        group: &GroupId,
    ) -> Result<(), StorageError> {
        sqlx::query(
            r#"
            INSERT INTO device_tokens (device_token, user_id, group_id, last_sync)
            VALUES (?1, ?2, ?3, 0)
            ON CONFLICT(device_token) DO UPDATE SET
                user_id = excluded.user_id,
                group_id = excluded.group_id
            "#,
        )
        .bind(device.as_str())
        .bind(user.as_str())
        .bind(group.as_str())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn migrate_operations(
        &self,
        from: &GroupId,
        to: &GroupId,
    ) -> Result<u64, StorageError> {
        let mut tx = self.pool.begin().await?;
        let tick = next_tick(&mut *tx).await?;

        let result = sqlx::query(
            "UPDATE operations SET group_id = ?2, created_at = ?3 WHERE group_id = ?1",
        )
        .bind(from.as_str())
        .bind(to.as_str())
        .bind(tick.value() as i64)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(result.rows_affected())
    }

    async fn delete_operations(&self, group: &GroupId) -> Result<u64, StorageError> {
        let result = sqlx::query("DELETE FROM operations WHERE group_id = ?1")
            .bind(group.as_str())
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected())
    }

    async fn copy_operations(&self, from: &GroupId, to: &GroupId) -> Result<u64, StorageError> {
        let mut tx = self.pool.begin().await?;

        let source: Vec<(i64,)> =
            sqlx::query_as("SELECT id FROM operations WHERE group_id = ?1 ORDER BY id ASC")
                .bind(from.as_str())
                .fetch_all(&mut *tx)
                .await?;

        for (old_id,) in &source {
            let new_id: i64 = sqlx::query_scalar(
                r#"
                INSERT INTO operations
                    (device_token, group_id, operation_type, statement, arguments, tombstone, created_at, recorded_at)
                SELECT device_token, ?2, operation_type, statement, arguments, tombstone, created_at, recorded_at
                FROM operations WHERE id = ?1
                RETURNING id
                "#,
            )
            .bind(old_id)
            .bind(to.as_str())
            .fetch_one(&mut *tx)
            .await?;

            sqlx::query(
                r#"
                INSERT INTO related_entities (operation_id, entity_id, entity_name)
                SELECT ?1, entity_id, entity_name FROM related_entities WHERE operation_id = ?2
                "#,
            )
            .bind(new_id)
            .bind(old_id)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(source.len() as u64)
    }

    async fn group_exists(&self, group: &GroupId) -> Result<bool, StorageError> {
        let exists: i64 = sqlx::query_scalar(
            "SELECT EXISTS(SELECT 1 FROM device_tokens WHERE group_id = ?1)",
        )
        .bind(group.as_str())
        .fetch_one(&self.pool)
        .await?;

        Ok(exists != 0)
    }

    async fn touch(
        &self,
        device: &DeviceToken,
        user: &UserId,
        group: &GroupId,
    ) -> Result<Tick, StorageError> {
        let mut tx = self.pool.begin().await?;
        let tick = next_tick(&mut *tx).await?;

        sqlx::query(
            r#"
            INSERT INTO device_tokens (device_token, user_id, group_id, last_sync)
            VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT(device_token) DO UPDATE SET
                user_id = excluded.user_id,
                group_id = excluded.group_id,
                last_sync = excluded.last_sync
            "#,
        )
        .bind(device.as_str())
        .bind(user.as_str())
        .bind(group.as_str())
        .bind(tick.value() as i64)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(tick)
    }

    async fn device_state(
        &self,
        device: &DeviceToken,
    ) -> Result<Option<DeviceState>, StorageError> {
        let row = sqlx::query_as::<_, DeviceRow>(
            r#"
            SELECT device_token, user_id, group_id, last_sync
            FROM device_tokens
            WHERE device_token = ?1
            "#,
        )
        .bind(device.as_str())
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(DeviceState::from))
    }

    async fn stats(&self) -> Result<StoreStats, StorageError> {
        let (operations, devices, groups): (i64, i64, i64) = sqlx::query_as(
            r#"
            SELECT
                (SELECT COUNT(*) FROM operations),
                (SELECT COUNT(*) FROM device_tokens),
                (SELECT COUNT(DISTINCT group_id) FROM device_tokens)
            "#,
        )
        .fetch_one(&self.pool)
        .await?;

        Ok(StoreStats {
            operations: operations as u64,
            devices: devices as u64,
            groups: groups as u64,
        })
    }
}

/// Internal row type for operation queries.
#[derive(sqlx::FromRow)]
struct OperationRow {
    id: i64,
    device_token: String,
    group_id: String,
    operation_type: String,
    statement: String,
    arguments: Option<String>,
    created_at: i64,
    recorded_at: i64,
}

impl OperationRow {
    fn into_logged(self, related_entities: Vec<RelatedEntity>) -> Result<LoggedOperation, StorageError> {
        let kind = OperationType::from_str(&self.operation_type).map_err(|e| {
            StorageError::Corrupt {
                table: "operations",
                reason: format!("row {}: {e}", self.id),
            }
        })?;

        Ok(LoggedOperation {
            id: self.id,
            device_token: DeviceToken::from(self.device_token),
            group_id: GroupId::from(self.group_id),
            operation: Operation {
                kind,
                statement: self.statement,
                arguments: self.arguments,
                related_entities,
            },
            created_at: Tick::new(self.created_at as u64),
            recorded_at: self.recorded_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct EntityRow {
    operation_id: i64,
    entity_id: String,
    entity_name: String,
}

#[derive(sqlx::FromRow)]
struct DeviceRow {
    device_token: String,
    user_id: String,
    group_id: String,
    last_sync: i64,
}

impl From<DeviceRow> for DeviceState {
    fn from(row: DeviceRow) -> Self {
        Self {
            device_token: DeviceToken::from(row.device_token),
            user_id: UserId::from(row.user_id),
            group_id: GroupId::from(row.group_id),
            last_sync: Tick::new(row.last_sync as u64),
        }
    }
}
