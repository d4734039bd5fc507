//! libSQL backend: async `Database` and `LocalStorage` implementation.
//!
//! Supports local file and in-memory databases.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params};
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::{DatabaseError, StorageError};
use crate::local::{ContextId, LocalStorage};
use crate::registration::model::{
    InviteCode, InviteRole, InviteStatus, Role, TierLevel, UserProfile,
};
use crate::store::migrations;
use crate::store::traits::Database;

/// libSQL database backend.
///
/// Stores a single connection that is reused for all operations.
/// `libsql::Connection` is `Send + Sync` and safe for concurrent async use.
pub struct LibSqlBackend {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
}

impl LibSqlBackend {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    DatabaseError::Pool(format!("Failed to create database directory: {e}"))
                })?;
            }
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        let backend = Self {
            db: Arc::new(db),
            conn,
        };
        backend.run_migrations().await?;
        info!(path = %path.display(), "Database opened");
        Ok(backend)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Pool(format!("Failed to create in-memory database: {e}"))
            })?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        let backend = Self {
            db: Arc::new(db),
            conn,
        };
        backend.run_migrations().await?;
        Ok(backend)
    }

    /// Get the connection.
    fn conn(&self) -> &Connection {
        &self.conn
    }
}

// ── Helper functions ────────────────────────────────────────────────

/// Parse an RFC 3339 or SQLite datetime string into DateTime<Utc>.
fn parse_datetime(s: &str) -> DateTime<Utc> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return dt.with_timezone(&Utc);
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return ndt.and_utc();
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
        return ndt.and_utc();
    }
    DateTime::<Utc>::MIN_UTC
}

fn parse_optional_datetime(s: &Option<String>) -> Option<DateTime<Utc>> {
    s.as_ref().map(|s| parse_datetime(s))
}

fn parse_optional_uuid(s: &Option<String>) -> Option<Uuid> {
    s.as_ref().and_then(|s| Uuid::parse_str(s).ok())
}

fn parse_tier(level: i64, what: &str) -> Result<TierLevel, DatabaseError> {
    u8::try_from(level)
        .ok()
        .and_then(TierLevel::new)
        .ok_or_else(|| DatabaseError::Serialization(format!("{what}: bad tier_level {level}")))
}

/// Convert `Option<String>` to libsql Value.
fn opt_text_owned(s: Option<String>) -> libsql::Value {
    match s {
        Some(s) => libsql::Value::Text(s),
        None => libsql::Value::Null,
    }
}

fn opt_real(v: Option<f64>) -> libsql::Value {
    match v {
        Some(v) => libsql::Value::Real(v),
        None => libsql::Value::Null,
    }
}

fn list_to_json(items: &[String]) -> Result<String, DatabaseError> {
    serde_json::to_string(items).map_err(|e| DatabaseError::Serialization(e.to_string()))
}

fn json_to_list(raw: &str) -> Vec<String> {
    serde_json::from_str(raw).unwrap_or_default()
}

/// Map an insert failure, recognising SQLite's uniqueness error.
fn insert_error(table: &str, op: &str, e: libsql::Error) -> DatabaseError {
    let message = e.to_string();
    if message.contains("UNIQUE constraint failed") {
        DatabaseError::UniqueViolation {
            table: table.to_string(),
            detail: message,
        }
    } else {
        DatabaseError::Query(format!("{op}: {message}"))
    }
}

/// Map a libsql Row to an InviteCode.
///
/// Column order matches INVITE_COLUMNS:
/// 0:code, 1:status, 2:role_type, 3:tier_level, 4:created_by, 5:used_by, 6:used_at, 7:created_at
fn row_to_invite(row: &libsql::Row) -> Result<InviteCode, DatabaseError> {
    let parse = |e: libsql::Error| DatabaseError::Query(format!("invite row parse: {e}"));

    let code: String = row.get(0).map_err(parse)?;
    let status_str: String = row.get(1).map_err(parse)?;
    let role_str: String = row.get(2).map_err(parse)?;
    let tier: i64 = row.get(3).map_err(parse)?;
    let created_by: Option<String> = row.get(4).ok();
    let used_by: Option<String> = row.get(5).ok();
    let used_at: Option<String> = row.get(6).ok();
    let created_str: String = row.get(7).map_err(parse)?;

    let role_type = InviteRole::parse(&role_str).ok_or_else(|| {
        DatabaseError::Serialization(format!("invite {code}: unknown role_type {role_str}"))
    })?;

    Ok(InviteCode {
        tier_level: parse_tier(tier, &code)?,
        status: InviteStatus::parse(&status_str),
        role_type,
        created_by: parse_optional_uuid(&created_by),
        used_by: parse_optional_uuid(&used_by),
        used_at: parse_optional_datetime(&used_at),
        created_at: parse_datetime(&created_str),
        code,
    })
}

/// Map a libsql Row to a UserProfile.
///
/// Column order matches PROFILE_COLUMNS:
/// 0:id, 1:role, 2:tier_level, 3:display_name, 4:bio, 5:location,
/// 6:profile_complete, 7:offers_production_services, 8:hourly_rate,
/// 9:musical_styles, 10:instruments, 11:equipment, 12:created_at, 13:updated_at
fn row_to_profile(row: &libsql::Row) -> Result<UserProfile, DatabaseError> {
    let parse = |e: libsql::Error| DatabaseError::Query(format!("profile row parse: {e}"));

    let id_str: String = row.get(0).map_err(parse)?;
    let role_str: String = row.get(1).map_err(parse)?;
    let tier: i64 = row.get(2).map_err(parse)?;
    let complete: i64 = row.get(6).map_err(parse)?;
    let offers: i64 = row.get(7).map_err(parse)?;
    let styles: String = row.get(9).map_err(parse)?;
    let instruments: String = row.get(10).map_err(parse)?;
    let equipment: String = row.get(11).map_err(parse)?;
    let created_str: String = row.get(12).map_err(parse)?;
    let updated_str: String = row.get(13).map_err(parse)?;

    let id = Uuid::parse_str(&id_str)
        .map_err(|e| DatabaseError::Serialization(format!("profile id {id_str}: {e}")))?;
    let role = Role::parse(&role_str).ok_or_else(|| {
        DatabaseError::Serialization(format!("profile {id}: unknown role {role_str}"))
    })?;

    Ok(UserProfile {
        id,
        role,
        tier_level: parse_tier(tier, &id_str)?,
        display_name: row.get(3).ok(),
        bio: row.get(4).ok(),
        location: row.get(5).ok(),
        profile_complete: complete != 0,
        offers_production_services: offers != 0,
        hourly_rate: row.get(8).ok(),
        musical_styles: json_to_list(&styles),
        instruments: json_to_list(&instruments),
        equipment: json_to_list(&equipment),
        created_at: parse_datetime(&created_str),
        updated_at: parse_datetime(&updated_str),
    })
}

// ── Trait implementation ────────────────────────────────────────────

const INVITE_COLUMNS: &str = "code, status, role_type, tier_level, created_by, used_by, used_at, created_at";

const PROFILE_COLUMNS: &str = "id, role, tier_level, display_name, bio, location, profile_complete, offers_production_services, hourly_rate, musical_styles, instruments, equipment, created_at, updated_at";

#[async_trait]
impl Database for LibSqlBackend {
    async fn run_migrations(&self) -> Result<(), DatabaseError> {
        migrations::run_migrations(self.conn()).await
    }

    // ── Invites ─────────────────────────────────────────────────────

    async fn insert_invite(&self, invite: &InviteCode) -> Result<(), DatabaseError> {
        let conn = self.conn();
        conn.execute(
            &format!(
                "INSERT INTO invites ({INVITE_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)"
            ),
            params![
                invite.code.clone(),
                invite.status.as_str(),
                invite.role_type.as_str(),
                i64::from(invite.tier_level.get()),
                opt_text_owned(invite.created_by.map(|u| u.to_string())),
                opt_text_owned(invite.used_by.map(|u| u.to_string())),
                opt_text_owned(invite.used_at.map(|t| t.to_rfc3339())),
                invite.created_at.to_rfc3339(),
            ],
        )
        .await
        .map_err(|e| insert_error("invites", "insert_invite", e))?;

        debug!(code = %invite.code, role = %invite.role_type, "Invite inserted into DB");
        Ok(())
    }

    async fn get_invite(&self, code: &str) -> Result<Option<InviteCode>, DatabaseError> {
        let conn = self.conn();
        let mut rows = conn
            .query(
                &format!("SELECT {INVITE_COLUMNS} FROM invites WHERE code = ?1"),
                params![code],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_invite: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_invite(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("get_invite: {e}"))),
        }
    }

    async fn get_available_invite(&self, code: &str) -> Result<Option<InviteCode>, DatabaseError> {
        let conn = self.conn();
        let mut rows = conn
            .query(
                &format!(
                    "SELECT {INVITE_COLUMNS} FROM invites WHERE code = ?1 AND status = 'available'"
                ),
                params![code],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_available_invite: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_invite(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("get_available_invite: {e}"))),
        }
    }

    async fn list_invites(&self, limit: usize) -> Result<Vec<InviteCode>, DatabaseError> {
        let conn = self.conn();
        let mut rows = conn
            .query(
                &format!(
                    "SELECT {INVITE_COLUMNS} FROM invites ORDER BY created_at DESC, code ASC LIMIT ?1"
                ),
                params![limit as i64],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_invites: {e}")))?;

        let mut invites = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("list_invites: {e}")))?
        {
            invites.push(row_to_invite(&row)?);
        }
        Ok(invites)
    }

    async fn mark_invite_used(
        &self,
        code: &str,
        user_id: Uuid,
        used_at: DateTime<Utc>,
    ) -> Result<bool, DatabaseError> {
        let conn = self.conn();
        let count = conn
            .execute(
                "UPDATE invites SET status = 'used', used_by = ?1, used_at = ?2
                 WHERE code = ?3 AND status = 'available'",
                params![user_id.to_string(), used_at.to_rfc3339(), code],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("mark_invite_used: {e}")))?;

        debug!(code, user_id = %user_id, consumed = count > 0, "Invite consumption attempted");
        Ok(count > 0)
    }

    // ── Profiles ────────────────────────────────────────────────────

    async fn insert_profile(&self, profile: &UserProfile) -> Result<(), DatabaseError> {
        let conn = self.conn();
        conn.execute(
            &format!(
                "INSERT INTO profiles ({PROFILE_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)"
            ),
            params![
                profile.id.to_string(),
                profile.role.as_str(),
                i64::from(profile.tier_level.get()),
                opt_text_owned(profile.display_name.clone()),
                opt_text_owned(profile.bio.clone()),
                opt_text_owned(profile.location.clone()),
                i64::from(profile.profile_complete),
                i64::from(profile.offers_production_services),
                opt_real(profile.hourly_rate),
                list_to_json(&profile.musical_styles)?,
                list_to_json(&profile.instruments)?,
                list_to_json(&profile.equipment)?,
                profile.created_at.to_rfc3339(),
                profile.updated_at.to_rfc3339(),
            ],
        )
        .await
        .map_err(|e| insert_error("profiles", "insert_profile", e))?;

        debug!(profile_id = %profile.id, role = %profile.role, "Profile inserted into DB");
        Ok(())
    }

    async fn get_profile(&self, id: Uuid) -> Result<Option<UserProfile>, DatabaseError> {
        let conn = self.conn();
        let mut rows = conn
            .query(
                &format!("SELECT {PROFILE_COLUMNS} FROM profiles WHERE id = ?1"),
                params![id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_profile: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_profile(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("get_profile: {e}"))),
        }
    }

    async fn update_profile(&self, profile: &UserProfile) -> Result<(), DatabaseError> {
        let conn = self.conn();
        let count = conn
            .execute(
                "UPDATE profiles SET display_name = ?1, bio = ?2, location = ?3,
                    profile_complete = ?4, offers_production_services = ?5, hourly_rate = ?6,
                    musical_styles = ?7, instruments = ?8, equipment = ?9, updated_at = ?10
                 WHERE id = ?11",
                params![
                    opt_text_owned(profile.display_name.clone()),
                    opt_text_owned(profile.bio.clone()),
                    opt_text_owned(profile.location.clone()),
                    i64::from(profile.profile_complete),
                    i64::from(profile.offers_production_services),
                    opt_real(profile.hourly_rate),
                    list_to_json(&profile.musical_styles)?,
                    list_to_json(&profile.instruments)?,
                    list_to_json(&profile.equipment)?,
                    profile.updated_at.to_rfc3339(),
                    profile.id.to_string(),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("update_profile: {e}")))?;

        if count == 0 {
            return Err(DatabaseError::NotFound {
                entity: "profile".to_string(),
                id: profile.id.to_string(),
            });
        }
        debug!(profile_id = %profile.id, complete = profile.profile_complete, "Profile updated in DB");
        Ok(())
    }

    async fn delete_profile(&self, id: Uuid) -> Result<bool, DatabaseError> {
        let conn = self.conn();
        let count = conn
            .execute("DELETE FROM profiles WHERE id = ?1", params![id.to_string()])
            .await
            .map_err(|e| DatabaseError::Query(format!("delete_profile: {e}")))?;
        Ok(count > 0)
    }
}

// ── Client context slots ────────────────────────────────────────────

#[async_trait]
impl LocalStorage for LibSqlBackend {
    async fn get(&self, scope: &ContextId, key: &str) -> Result<Option<String>, StorageError> {
        let conn = self.conn();
        let mut rows = conn
            .query(
                "SELECT value FROM context_slots WHERE context_id = ?1 AND key = ?2",
                params![scope.as_str(), key],
            )
            .await
            .map_err(|e| StorageError::Backend(format!("get slot: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => row
                .get::<String>(0)
                .map(Some)
                .map_err(|e| StorageError::Backend(format!("get slot: {e}"))),
            Ok(None) => Ok(None),
            Err(e) => Err(StorageError::Backend(format!("get slot: {e}"))),
        }
    }

    async fn set(&self, scope: &ContextId, key: &str, value: &str) -> Result<(), StorageError> {
        let conn = self.conn();
        let now = Utc::now().to_rfc3339();
        conn.execute(
            "INSERT INTO context_slots (context_id, key, value, updated_at) VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT (context_id, key) DO UPDATE SET value = ?3, updated_at = ?4",
            params![scope.as_str(), key, value, now],
        )
        .await
        .map_err(|e| StorageError::Backend(format!("set slot: {e}")))?;
        Ok(())
    }

    async fn remove(&self, scope: &ContextId, key: &str) -> Result<bool, StorageError> {
        let conn = self.conn();
        let count = conn
            .execute(
                "DELETE FROM context_slots WHERE context_id = ?1 AND key = ?2",
                params![scope.as_str(), key],
            )
            .await
            .map_err(|e| StorageError::Backend(format!("remove slot: {e}")))?;
        Ok(count > 0)
    }
}

// ── Tests ───────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    async fn test_db() -> LibSqlBackend {
        LibSqlBackend::new_memory().await.unwrap()
    }

    fn make_invite(code: &str) -> InviteCode {
        InviteCode::new(code, InviteRole::Studio, TierLevel::new(2).unwrap())
    }

    // ── Invite tests ────────────────────────────────────────────────

    #[tokio::test]
    async fn insert_and_get_invite() {
        let db = test_db().await;
        let creator = Uuid::new_v4();
        db.insert_invite(&make_invite("STUDIO4821").with_created_by(creator))
            .await
            .unwrap();

        let fetched = db.get_invite("STUDIO4821").await.unwrap().unwrap();
        assert_eq!(fetched.code, "STUDIO4821");
        assert_eq!(fetched.role_type, InviteRole::Studio);
        assert_eq!(fetched.tier_level.get(), 2);
        assert_eq!(fetched.status, InviteStatus::Available);
        assert_eq!(fetched.created_by, Some(creator));
        assert!(fetched.used_by.is_none());
    }

    #[tokio::test]
    async fn duplicate_invite_is_unique_violation() {
        let db = test_db().await;
        db.insert_invite(&make_invite("STUDIO4821")).await.unwrap();
        let err = db.insert_invite(&make_invite("STUDIO4821")).await.unwrap_err();
        assert!(err.is_unique_violation(), "unexpected error: {err}");
    }

    #[tokio::test]
    async fn mark_used_happens_once() {
        let db = test_db().await;
        db.insert_invite(&make_invite("STUDIO4821")).await.unwrap();
        let user = Uuid::new_v4();

        assert!(db.mark_invite_used("STUDIO4821", user, Utc::now()).await.unwrap());
        assert!(!db.mark_invite_used("STUDIO4821", Uuid::new_v4(), Utc::now()).await.unwrap());

        let fetched = db.get_invite("STUDIO4821").await.unwrap().unwrap();
        assert_eq!(fetched.status, InviteStatus::Used);
        assert_eq!(fetched.used_by, Some(user));
        assert!(fetched.used_at.is_some());

        assert!(db.get_available_invite("STUDIO4821").await.unwrap().is_none());
        assert!(!db.mark_invite_used("MISSING1", user, Utc::now()).await.unwrap());
    }

    #[tokio::test]
    async fn list_invites_newest_first() {
        let db = test_db().await;
        let mut older = make_invite("ARTIST0001");
        older.created_at = Utc::now() - chrono::Duration::hours(1);
        db.insert_invite(&older).await.unwrap();
        db.insert_invite(&make_invite("STUDIO0002")).await.unwrap();

        let invites = db.list_invites(10).await.unwrap();
        assert_eq!(invites.len(), 2);
        assert_eq!(invites[0].code, "STUDIO0002");

        assert_eq!(db.list_invites(1).await.unwrap().len(), 1);
    }

    // ── Profile tests ───────────────────────────────────────────────

    #[tokio::test]
    async fn insert_and_get_profile() {
        let db = test_db().await;
        let id = Uuid::new_v4();
        let profile = UserProfile::new_incomplete(id, Role::ArtistProducer, TierLevel::default());
        db.insert_profile(&profile).await.unwrap();

        let fetched = db.get_profile(id).await.unwrap().unwrap();
        assert_eq!(fetched.role, Role::ArtistProducer);
        assert_eq!(fetched.tier_level.get(), 1);
        assert!(!fetched.profile_complete);
        assert!(fetched.display_name.is_none());
        assert!(fetched.hourly_rate.is_none());
        assert!(fetched.musical_styles.is_empty());
    }

    #[tokio::test]
    async fn duplicate_profile_is_unique_violation() {
        let db = test_db().await;
        let id = Uuid::new_v4();
        let profile = UserProfile::new_incomplete(id, Role::Studio, TierLevel::default());
        db.insert_profile(&profile).await.unwrap();
        let err = db.insert_profile(&profile).await.unwrap_err();
        assert!(err.is_unique_violation());

        assert!(db.delete_profile(id).await.unwrap());
        db.insert_profile(&profile).await.unwrap();
    }

    #[tokio::test]
    async fn update_profile_fields() {
        let db = test_db().await;
        let id = Uuid::new_v4();
        let mut profile = UserProfile::new_incomplete(id, Role::Studio, TierLevel::default());
        db.insert_profile(&profile).await.unwrap();

        profile.display_name = Some("Blue Room".into());
        profile.hourly_rate = Some(45.5);
        profile.equipment = vec!["Neve 1073".into(), "SSL bus comp".into()];
        profile.profile_complete = true;
        db.update_profile(&profile).await.unwrap();

        let fetched = db.get_profile(id).await.unwrap().unwrap();
        assert_eq!(fetched.display_name.as_deref(), Some("Blue Room"));
        assert_eq!(fetched.hourly_rate, Some(45.5));
        assert_eq!(fetched.equipment.len(), 2);
        assert!(fetched.profile_complete);
    }

    #[tokio::test]
    async fn update_missing_profile_is_not_found() {
        let db = test_db().await;
        let profile = UserProfile::new_incomplete(Uuid::new_v4(), Role::Studio, TierLevel::default());
        let err = db.update_profile(&profile).await.unwrap_err();
        assert!(matches!(err, DatabaseError::NotFound { .. }));
    }

    // ── Slot tests ──────────────────────────────────────────────────

    #[tokio::test]
    async fn context_slots_upsert_and_remove() {
        let db = test_db().await;
        let scope = ContextId::generate();

        assert!(db.get(&scope, "k").await.unwrap().is_none());
        db.set(&scope, "k", "one").await.unwrap();
        db.set(&scope, "k", "two").await.unwrap();
        assert_eq!(db.get(&scope, "k").await.unwrap().as_deref(), Some("two"));

        let other = ContextId::generate();
        assert!(db.get(&other, "k").await.unwrap().is_none());

        assert!(db.remove(&scope, "k").await.unwrap());
        assert!(!db.remove(&scope, "k").await.unwrap());
    }

    #[tokio::test]
    async fn slots_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("wavr.db");
        let scope = ContextId::generate();

        {
            let db = LibSqlBackend::new_local(&path).await.unwrap();
            db.set(&scope, "pending_registration", "{}").await.unwrap();
        }

        let db = LibSqlBackend::new_local(&path).await.unwrap();
        assert_eq!(
            db.get(&scope, "pending_registration").await.unwrap().as_deref(),
            Some("{}")
        );
    }
}
