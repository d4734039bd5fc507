//! Profile Materializer and profile-setup completion.

use std::sync::Arc;

use chrono::Utc;
use tracing::info;
use uuid::Uuid;

use super::model::{ProfileSetup, Role, TierLevel, UserProfile};
use super::validation::fields;
use crate::error::{DatabaseError, RegistrationError, ValidationErrors};
use crate::store::Database;

/// Creates and completes user profiles.
#[derive(Clone)]
pub struct ProfileMaterializer {
    db: Arc<dyn Database>,
}

impl ProfileMaterializer {
    pub fn new(db: Arc<dyn Database>) -> Self {
        Self { db }
    }

    /// Insert an incomplete profile for `id`.
    ///
    /// Not idempotent: a second call for the same id fails with
    /// `DatabaseError::UniqueViolation`.
    pub async fn materialize(
        &self,
        id: Uuid,
        role: Role,
        tier_level: TierLevel,
    ) -> Result<UserProfile, DatabaseError> {
        let profile = UserProfile::new_incomplete(id, role, tier_level);
        self.db.insert_profile(&profile).await?;
        info!(user_id = %id, role = %role, tier = %tier_level, "Profile created");
        Ok(profile)
    }

    pub async fn get(&self, id: Uuid) -> Result<Option<UserProfile>, DatabaseError> {
        self.db.get_profile(id).await
    }

    /// Whether `id` still has to go through profile setup (no profile, or an incomplete one).
    pub async fn needs_setup(&self, id: Uuid) -> Result<bool, DatabaseError> {
        Ok(!matches!(
            self.db.get_profile(id).await?,
            Some(profile) if profile.profile_complete
        ))
    }

    /// Fill in the profile from the setup form and mark it complete.
    pub async fn complete_setup(
        &self,
        id: Uuid,
        setup: ProfileSetup,
    ) -> Result<UserProfile, RegistrationError> {
        let mut errors = ValidationErrors::new();
        let display_name = setup.display_name.trim().to_string();
        if display_name.is_empty() {
            errors.add(fields::DISPLAY_NAME, "Display name is required");
        }
        if let Some(rate) = setup.hourly_rate {
            if !rate.is_finite() || rate < 0.0 {
                errors.add(fields::HOURLY_RATE, "Hourly rate cannot be negative");
            }
        }
        errors.into_result()?;

        let mut profile = self
            .db
            .get_profile(id)
            .await?
            .ok_or_else(|| DatabaseError::NotFound {
                entity: "profile".to_string(),
                id: id.to_string(),
            })?;

        profile.display_name = Some(display_name);
        profile.bio = non_blank(setup.bio);
        profile.location = non_blank(setup.location);
        profile.offers_production_services = setup.offers_production_services;
        profile.hourly_rate = setup.hourly_rate;
        profile.musical_styles = clean_list(setup.musical_styles);
        profile.instruments = clean_list(setup.instruments);
        profile.equipment = clean_list(setup.equipment);
        profile.profile_complete = true;
        profile.updated_at = Utc::now();

        self.db.update_profile(&profile).await?;
        info!(user_id = %id, role = %profile.role, "Profile setup completed");
        Ok(profile)
    }
}

fn non_blank(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn clean_list(items: Vec<String>) -> Vec<String> {
    items
        .into_iter()
        .map(|item| item.trim().to_string())
        .filter(|item| !item.is_empty())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::LibSqlBackend;

    async fn materializer() -> ProfileMaterializer {
        ProfileMaterializer::new(Arc::new(LibSqlBackend::new_memory().await.unwrap()))
    }

    fn setup(name: &str) -> ProfileSetup {
        ProfileSetup {
            display_name: name.to_string(),
            bio: Some("  ".into()),
            location: Some(" Berlin ".into()),
            offers_production_services: true,
            hourly_rate: Some(40.0),
            musical_styles: vec!["techno".into(), "".into()],
            instruments: vec![],
            equipment: vec![" Moog ".into()],
        }
    }

    #[tokio::test]
    async fn materialize_creates_incomplete_profile() {
        let m = materializer().await;
        let id = Uuid::new_v4();
        let profile = m
            .materialize(id, Role::ArtistProducer, TierLevel::default())
            .await
            .unwrap();
        assert!(!profile.profile_complete);

        let stored = m.get(id).await.unwrap().unwrap();
        assert_eq!(stored.role, Role::ArtistProducer);
        assert_eq!(stored.tier_level.get(), 1);
        assert!(m.needs_setup(id).await.unwrap());
    }

    #[tokio::test]
    async fn second_materialize_is_a_conflict() {
        let m = materializer().await;
        let id = Uuid::new_v4();
        m.materialize(id, Role::Studio, TierLevel::default()).await.unwrap();
        let err = m
            .materialize(id, Role::Studio, TierLevel::default())
            .await
            .unwrap_err();
        assert!(err.is_unique_violation());
    }

    #[tokio::test]
    async fn complete_setup_marks_complete() {
        let m = materializer().await;
        let id = Uuid::new_v4();
        m.materialize(id, Role::ArtistProducer, TierLevel::default())
            .await
            .unwrap();

        let profile = m.complete_setup(id, setup(" DJ Wave ")).await.unwrap();
        assert!(profile.profile_complete);
        assert_eq!(profile.display_name.as_deref(), Some("DJ Wave"));
        assert!(profile.bio.is_none());
        assert_eq!(profile.location.as_deref(), Some("Berlin"));
        assert_eq!(profile.musical_styles, vec!["techno".to_string()]);
        assert_eq!(profile.equipment, vec!["Moog".to_string()]);
        assert!(!m.needs_setup(id).await.unwrap());
    }

    #[tokio::test]
    async fn complete_setup_validates_fields() {
        let m = materializer().await;
        let id = Uuid::new_v4();
        m.materialize(id, Role::Studio, TierLevel::default()).await.unwrap();

        let mut bad = setup("   ");
        bad.hourly_rate = Some(-5.0);
        let err = m.complete_setup(id, bad).await.unwrap_err();
        let RegistrationError::Validation(errors) = err else {
            panic!("expected validation error, got {err:?}");
        };
        assert_eq!(errors.get(fields::DISPLAY_NAME), Some("Display name is required"));
        assert_eq!(errors.get(fields::HOURLY_RATE), Some("Hourly rate cannot be negative"));
    }

    #[tokio::test]
    async fn complete_setup_without_profile_is_not_found() {
        let m = materializer().await;
        let err = m.complete_setup(Uuid::new_v4(), setup("Name")).await.unwrap_err();
        assert!(matches!(
            err,
            RegistrationError::Database(DatabaseError::NotFound { .. })
        ));
        assert!(m.needs_setup(Uuid::new_v4()).await.unwrap());
    }
}
