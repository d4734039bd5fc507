//! Registration data models: invites, profiles, and staged registrations.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Role a profile is created with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    ArtistProducer,
    Studio,
}

impl Default for Role {
    fn default() -> Self {
        Self::ArtistProducer
    }
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ArtistProducer => "artist_producer",
            Self::Studio => "studio",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "artist_producer" => Some(Self::ArtistProducer),
            "studio" => Some(Self::Studio),
            _ => None,
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Role an invite code grants. Admin invites do not map to a profile role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InviteRole {
    ArtistProducer,
    Studio,
    Admin,
}

impl InviteRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ArtistProducer => "artist_producer",
            Self::Studio => "studio",
            Self::Admin => "admin",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "artist_producer" => Some(Self::ArtistProducer),
            "studio" => Some(Self::Studio),
            "admin" => Some(Self::Admin),
            _ => None,
        }
    }

    /// Profile role granted on redemption, if any.
    pub fn profile_role(&self) -> Option<Role> {
        match self {
            Self::ArtistProducer => Some(Role::ArtistProducer),
            Self::Studio => Some(Role::Studio),
            Self::Admin => None,
        }
    }

    /// Prefix used when generating codes for this role.
    pub fn code_prefix(&self) -> &'static str {
        match self {
            Self::ArtistProducer => "ARTIST",
            Self::Studio => "STUDIO",
            Self::Admin => "ADMIN",
        }
    }
}

impl std::fmt::Display for InviteRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Access-control rank, 1 through 3.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub struct TierLevel(u8);

impl TierLevel {
    pub const MIN: u8 = 1;
    pub const MAX: u8 = 3;

    pub fn new(level: u8) -> Option<Self> {
        (Self::MIN..=Self::MAX).contains(&level).then_some(Self(level))
    }

    pub fn get(&self) -> u8 {
        self.0
    }
}

impl Default for TierLevel {
    fn default() -> Self {
        Self(Self::MIN)
    }
}

impl TryFrom<u8> for TierLevel {
    type Error = String;

    fn try_from(level: u8) -> Result<Self, Self::Error> {
        Self::new(level).ok_or_else(|| {
            format!(
                "tier level must be between {} and {}, got {level}",
                Self::MIN,
                Self::MAX
            )
        })
    }
}

impl From<TierLevel> for u8 {
    fn from(tier: TierLevel) -> Self {
        tier.0
    }
}

impl std::fmt::Display for TierLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Invite code lifecycle. `Available → Used` happens once and never reverses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InviteStatus {
    Available,
    Used,
}

impl InviteStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Available => "available",
            Self::Used => "used",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "used" => Self::Used,
            _ => Self::Available,
        }
    }
}

/// How the user is registering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RegistrationMode {
    Public,
    Invite,
}

impl Default for RegistrationMode {
    fn default() -> Self {
        Self::Public
    }
}

impl std::fmt::Display for RegistrationMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Public => write!(f, "public"),
            Self::Invite => write!(f, "invite"),
        }
    }
}

/// A pre-provisioned, single-use registration token.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InviteCode {
    /// Normalized (trimmed, uppercase) code.
    pub code: String,
    pub status: InviteStatus,
    #[serde(alias = "code_type")]
    pub role_type: InviteRole,
    pub tier_level: TierLevel,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_by: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub used_by: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub used_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl InviteCode {
    /// A fresh, available invite. `code` must already be normalized.
    pub fn new(code: impl Into<String>, role_type: InviteRole, tier_level: TierLevel) -> Self {
        Self {
            code: code.into(),
            status: InviteStatus::Available,
            role_type,
            tier_level,
            created_by: None,
            used_by: None,
            used_at: None,
            created_at: Utc::now(),
        }
    }

    pub fn with_created_by(mut self, user_id: Uuid) -> Self {
        self.created_by = Some(user_id);
        self
    }

    pub fn is_available(&self) -> bool {
        self.status == InviteStatus::Available
    }
}

/// A user's profile row. `id` is the identity provider's user id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserProfile {
    pub id: Uuid,
    pub role: Role,
    pub tier_level: TierLevel,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bio: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    pub profile_complete: bool,
    pub offers_production_services: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hourly_rate: Option<f64>,
    #[serde(default)]
    pub musical_styles: Vec<String>,
    #[serde(default)]
    pub instruments: Vec<String>,
    #[serde(default)]
    pub equipment: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl UserProfile {
    /// A freshly materialized profile: incomplete, optional attributes unset.
    pub fn new_incomplete(id: Uuid, role: Role, tier_level: TierLevel) -> Self {
        let now = Utc::now();
        Self {
            id,
            role,
            tier_level,
            display_name: None,
            bio: None,
            location: None,
            profile_complete: false,
            offers_production_services: false,
            hourly_rate: None,
            musical_styles: Vec::new(),
            instruments: Vec::new(),
            equipment: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }
}

/// Fields submitted by the profile-setup step.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProfileSetup {
    pub display_name: String,
    #[serde(default)]
    pub bio: Option<String>,
    #[serde(default)]
    pub location: Option<String>,
    #[serde(default)]
    pub offers_production_services: bool,
    #[serde(default)]
    pub hourly_rate: Option<f64>,
    #[serde(default)]
    pub musical_styles: Vec<String>,
    #[serde(default)]
    pub instruments: Vec<String>,
    #[serde(default)]
    pub equipment: Vec<String>,
}

/// Registration staged between signup and email confirmation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingRegistration {
    pub role: Role,
    pub tier_level: TierLevel,
    pub email: String,
    pub registration_mode: RegistrationMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub invite_code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub invite_data: Option<InviteCode>,
}

impl PendingRegistration {
    /// Data handed to the profile-setup step once this registration is
    /// finalized with the role and tier actually granted.
    pub fn setup_stage(&self, role: Role, tier_level: TierLevel) -> ProfileSetupStage {
        ProfileSetupStage {
            role,
            tier_level,
            email: self.email.clone(),
            registration_mode: self.registration_mode,
        }
    }

    /// Whether this registration belongs to `email` (case-insensitive).
    pub fn belongs_to(&self, email: &str) -> bool {
        self.email.eq_ignore_ascii_case(email.trim())
    }
}

/// What the profile-setup page needs to know about a just-finalized registration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProfileSetupStage {
    pub role: Role,
    pub tier_level: TierLevel,
    pub email: String,
    pub registration_mode: RegistrationMode,
}
