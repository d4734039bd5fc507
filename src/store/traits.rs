//! `Database` trait: async interface over the relational store.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::DatabaseError;
use crate::registration::model::{InviteCode, UserProfile};

/// Backend-agnostic database trait covering invites and profiles.
#[async_trait]
pub trait Database: Send + Sync {
    /// Run all pending schema migrations.
    async fn run_migrations(&self) -> Result<(), DatabaseError>;

    // ── Invites ─────────────────────────────────────────────────────

    /// Insert a new invite. A duplicate code yields `DatabaseError::UniqueViolation`.
    async fn insert_invite(&self, invite: &InviteCode) -> Result<(), DatabaseError>;

    /// Look up an invite by its normalized code, whatever its status.
    async fn get_invite(&self, code: &str) -> Result<Option<InviteCode>, DatabaseError>;

    /// Look up an invite by code, only if its status is `available`.
    async fn get_available_invite(&self, code: &str) -> Result<Option<InviteCode>, DatabaseError>;

    /// Invites, newest first, up to `limit`.
    async fn list_invites(&self, limit: usize) -> Result<Vec<InviteCode>, DatabaseError>;

    /// Flip an invite from `available` to `used`.
    ///
    /// Returns `false` when the code does not exist or was already used; the
    /// transition happens at most once per code.
    async fn mark_invite_used(
        &self,
        code: &str,
        user_id: Uuid,
        used_at: DateTime<Utc>,
    ) -> Result<bool, DatabaseError>;

    // ── Profiles ────────────────────────────────────────────────────

    /// Insert a profile. An existing id yields `DatabaseError::UniqueViolation`.
    async fn insert_profile(&self, profile: &UserProfile) -> Result<(), DatabaseError>;

    async fn get_profile(&self, id: Uuid) -> Result<Option<UserProfile>, DatabaseError>;

    /// Overwrite a profile's mutable fields. `NotFound` if the id is unknown.
    async fn update_profile(&self, profile: &UserProfile) -> Result<(), DatabaseError>;

    /// Delete a profile. Returns whether a row was removed.
    async fn delete_profile(&self, id: Uuid) -> Result<bool, DatabaseError>;
}
