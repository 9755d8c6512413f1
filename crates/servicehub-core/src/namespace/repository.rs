//! `NamespaceRepository` — key-addressed persistent store of namespaces (§4.2).

use std::sync::Arc;

use chrono::Utc;
use rusqlite::{params, OptionalExtension};
use uuid::Uuid;

use crate::db::SqliteHandle;
use crate::error::EngineError;

use super::model::{AuthType, Namespace};

/// Invoked whenever a namespace's credential changes, so
/// `BrokerClientCache` can invalidate the corresponding wrapper (§5).
pub type InvalidationHook = Arc<dyn Fn(Uuid) + Send + Sync>;

/// Persistent store of namespace records.
pub struct NamespaceRepository {
    db: SqliteHandle,
    invalidation_hook: Option<InvalidationHook>,
}

impl NamespaceRepository {
    /// Open the repository against an existing SQLite handle, creating the
    /// `namespaces` table if absent.
    pub async fn new(db: SqliteHandle) -> Result<Self, EngineError> {
        db.with_conn(|conn| {
            conn.execute_batch(
                "CREATE TABLE IF NOT EXISTS namespaces (
                    id TEXT PRIMARY KEY,
                    name TEXT NOT NULL,
                    display_name TEXT NOT NULL,
                    auth_type TEXT NOT NULL,
                    encrypted_credential TEXT NOT NULL,
                    is_active INTEGER NOT NULL,
                    created_at TEXT NOT NULL,
                    updated_at TEXT NOT NULL
                );
                CREATE UNIQUE INDEX IF NOT EXISTS idx_namespaces_active_name
                    ON namespaces(name) WHERE is_active = 1;",
            )
            .map_err(EngineError::from)
        })
        .await?;

        Ok(Self {
            db,
            invalidation_hook: None,
        })
    }

    /// Register the callback fired on credential rotation.
    pub fn with_invalidation_hook(mut self, hook: InvalidationHook) -> Self {
        self.invalidation_hook = Some(hook);
        self
    }

    /// Fetch by id.
    pub async fn get_by_id(&self, id: Uuid) -> Result<Namespace, EngineError> {
        self.db
            .with_conn(move |conn| {
                conn.query_row(
                    "SELECT id, name, display_name, auth_type, encrypted_credential, \
                     is_active, created_at, updated_at FROM namespaces WHERE id = ?1",
                    params![id.to_string()],
                    row_to_namespace,
                )
                .optional()
                .map_err(EngineError::from)?
                .ok_or_else(|| EngineError::not_found("namespace", id))
            })
            .await?
    }

    /// Fetch by name (active or not).
    pub async fn get_by_name(&self, name: &str) -> Result<Namespace, EngineError> {
        let name = name.to_string();
        self.db
            .with_conn(move |conn| {
                conn.query_row(
                    "SELECT id, name, display_name, auth_type, encrypted_credential, \
                     is_active, created_at, updated_at FROM namespaces WHERE name = ?1",
                    params![name],
                    row_to_namespace,
                )
                .optional()
                .map_err(EngineError::from)?
                .ok_or_else(|| EngineError::not_found("namespace", name))
            })
            .await?
    }

    /// All active namespaces, used by the scanner to enumerate its scope.
    pub async fn get_active(&self) -> Result<Vec<Namespace>, EngineError> {
        self.db
            .with_conn(|conn| {
                let mut stmt = conn.prepare_cached(
                    "SELECT id, name, display_name, auth_type, encrypted_credential, \
                     is_active, created_at, updated_at FROM namespaces WHERE is_active = 1",
                )?;
                let rows = stmt
                    .query_map([], row_to_namespace)?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await
    }

    /// Insert a new namespace. Fails with `Conflict` if an active namespace
    /// already uses `name`, or `ValidationFailed` if the credential
    /// invariant in §3 is violated.
    pub async fn create(
        &self,
        name: String,
        display_name: String,
        auth_type: AuthType,
        encrypted_credential: String,
    ) -> Result<Namespace, EngineError> {
        if auth_type == AuthType::ConnectionString && encrypted_credential.is_empty() {
            return Err(EngineError::ValidationFailed(
                "encrypted_credential must be present for ConnectionString auth".to_string(),
            ));
        }

        let now = Utc::now();
        let namespace = Namespace {
            id: Uuid::new_v4(),
            name: name.clone(),
            display_name,
            auth_type,
            encrypted_credential,
            is_active: true,
            created_at: now,
            updated_at: now,
        };

        let to_insert = namespace.clone();
        self.db
            .with_conn(move |conn| {
                let existing: Option<i64> = conn
                    .query_row(
                        "SELECT 1 FROM namespaces WHERE name = ?1 AND is_active = 1",
                        params![to_insert.name],
                        |row| row.get(0),
                    )
                    .optional()
                    .map_err(EngineError::from)?;
                if existing.is_some() {
                    return Err(EngineError::Conflict(format!(
                        "namespace '{}' already active",
                        to_insert.name
                    )));
                }

                conn.execute(
                    "INSERT INTO namespaces (id, name, display_name, auth_type, \
                     encrypted_credential, is_active, created_at, updated_at) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                    params![
                        to_insert.id.to_string(),
                        to_insert.name,
                        to_insert.display_name,
                        to_insert.auth_type.as_str(),
                        to_insert.encrypted_credential,
                        to_insert.is_active as i64,
                        to_insert.created_at.to_rfc3339(),
                        to_insert.updated_at.to_rfc3339(),
                    ],
                )
                .map_err(EngineError::from)?;
                Ok(())
            })
            .await?;

        Ok(namespace)
    }

    /// Rotate the stored credential. Emits the invalidation hook so
    /// `BrokerClientCache` drops its now-stale wrapper (§5, §6 S6).
    pub async fn update_credential(
        &self,
        id: Uuid,
        new_encrypted_credential: String,
    ) -> Result<Namespace, EngineError> {
        if new_encrypted_credential.is_empty() {
            return Err(EngineError::ValidationFailed(
                "encrypted_credential must not be empty".to_string(),
            ));
        }

        let now = Utc::now();
        let updated = self
            .db
            .with_conn(move |conn| {
                let changed = conn.execute(
                    "UPDATE namespaces SET encrypted_credential = ?1, updated_at = ?2 \
                     WHERE id = ?3",
                    params![new_encrypted_credential, now.to_rfc3339(), id.to_string()],
                )?;
                if changed == 0 {
                    return Err(EngineError::not_found("namespace", id));
                }
                conn.query_row(
                    "SELECT id, name, display_name, auth_type, encrypted_credential, \
                     is_active, created_at, updated_at FROM namespaces WHERE id = ?1",
                    params![id.to_string()],
                    row_to_namespace,
                )
                .map_err(EngineError::from)
            })
            .await?;

        if let Some(hook) = &self.invalidation_hook {
            hook(id);
        }

        Ok(updated)
    }

    /// Activate or deactivate a namespace. Deactivation is the only
    /// "removal" — rows are never deleted so history stays joinable.
    pub async fn set_active(&self, id: Uuid, is_active: bool) -> Result<Namespace, EngineError> {
        let now = Utc::now();
        self.db
            .with_conn(move |conn| {
                let changed = conn.execute(
                    "UPDATE namespaces SET is_active = ?1, updated_at = ?2 WHERE id = ?3",
                    params![is_active as i64, now.to_rfc3339(), id.to_string()],
                )?;
                if changed == 0 {
                    return Err(EngineError::not_found("namespace", id));
                }
                conn.query_row(
                    "SELECT id, name, display_name, auth_type, encrypted_credential, \
                     is_active, created_at, updated_at FROM namespaces WHERE id = ?1",
                    params![id.to_string()],
                    row_to_namespace,
                )
                .map_err(EngineError::from)
            })
            .await
    }
}

fn row_to_namespace(row: &rusqlite::Row<'_>) -> rusqlite::Result<Namespace> {
    let id: String = row.get(0)?;
    let auth_type: String = row.get(3)?;
    let is_active: i64 = row.get(5)?;
    let created_at: String = row.get(6)?;
    let updated_at: String = row.get(7)?;

    Ok(Namespace {
        id: Uuid::parse_str(&id).unwrap_or_default(),
        name: row.get(1)?,
        display_name: row.get(2)?,
        auth_type: AuthType::from_str(&auth_type).unwrap_or(AuthType::ManagedIdentity),
        encrypted_credential: row.get(4)?,
        is_active: is_active != 0,
        created_at: chrono::DateTime::parse_from_rfc3339(&created_at)
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or_else(|_| Utc::now()),
        updated_at: chrono::DateTime::parse_from_rfc3339(&updated_at)
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or_else(|_| Utc::now()),
    })
}
