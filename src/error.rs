//! Error types for wavr.

use std::collections::BTreeMap;

/// Top-level error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Auth error: {0}")]
    Auth(#[from] AuthError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Validation error: {0}")]
    Validation(#[from] ValidationErrors),

    #[error("Invite error: {0}")]
    Invite(#[from] InviteError),

    #[error("Registration error: {0}")]
    Registration(#[from] RegistrationError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Database-related errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection pool error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Entity not found: {entity} with id {id}")]
    NotFound { entity: String, id: String },

    /// A row with the same unique key already exists.
    #[error("Unique constraint violated on {table}: {detail}")]
    UniqueViolation { table: String, detail: String },

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl DatabaseError {
    /// Whether this is a uniqueness conflict (duplicate key).
    pub fn is_unique_violation(&self) -> bool {
        matches!(self, Self::UniqueViolation { .. })
    }
}

/// Identity provider errors.
#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    /// The provider rejected the request. `message` is shown to the user as-is.
    #[error("{message}")]
    Rejected { status: u16, message: String },

    #[error("Identity provider request failed: {0}")]
    Transport(String),

    #[error("Invalid response from identity provider: {0}")]
    InvalidResponse(String),

    #[error("No active session")]
    NoSession,

    #[error("Not authorized: {0}")]
    Forbidden(String),
}

/// Client-local storage errors.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("Storage backend failed: {0}")]
    Backend(String),

    #[error("Corrupt value under key {key}: {reason}")]
    Corrupt { key: String, reason: String },
}

impl From<DatabaseError> for StorageError {
    fn from(e: DatabaseError) -> Self {
        StorageError::Backend(e.to_string())
    }
}

/// Per-field validation failures, caught before any network call.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize, thiserror::Error)]
#[error("{}", summarize(.fields))]
pub struct ValidationErrors {
    pub fields: BTreeMap<String, String>,
}

impl ValidationErrors {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an error for `field`. The first error per field wins.
    pub fn add(&mut self, field: &str, message: impl Into<String>) {
        self.fields
            .entry(field.to_string())
            .or_insert_with(|| message.into());
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn get(&self, field: &str) -> Option<&str> {
        self.fields.get(field).map(String::as_str)
    }

    /// `Ok(())` when no field failed.
    pub fn into_result(self) -> std::result::Result<(), ValidationErrors> {
        if self.is_empty() { Ok(()) } else { Err(self) }
    }
}

fn summarize(fields: &BTreeMap<String, String>) -> String {
    fields
        .iter()
        .map(|(field, message)| format!("{field}: {message}"))
        .collect::<Vec<_>>()
        .join("; ")
}

/// Invite code errors.
#[derive(Debug, thiserror::Error)]
pub enum InviteError {
    #[error("This invite code already exists")]
    AlreadyExists,

    #[error("Invalid invite code: {0}")]
    Malformed(String),

    #[error("Could not generate a unique invite code after {attempts} attempts")]
    GenerationExhausted { attempts: u32 },

    #[error(transparent)]
    Database(DatabaseError),
}

impl From<DatabaseError> for InviteError {
    fn from(e: DatabaseError) -> Self {
        if e.is_unique_violation() {
            InviteError::AlreadyExists
        } else {
            InviteError::Database(e)
        }
    }
}

/// Errors surfaced by the registration and sign-in flows.
#[derive(Debug, thiserror::Error)]
pub enum RegistrationError {
    #[error(transparent)]
    Validation(#[from] ValidationErrors),

    /// Provider rejection; displayed verbatim in the banner.
    #[error(transparent)]
    Provider(#[from] AuthError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Database(#[from] DatabaseError),

    #[error(transparent)]
    Invite(#[from] InviteError),
}

/// Result type alias.
pub type Result<T> = std::result::Result<T, Error>;
