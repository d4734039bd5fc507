//! Form validation run before any network call.
//!
//! Errors are collected per field so a form can show all of them at once.

use std::sync::LazyLock;

use regex::Regex;

use super::model::RegistrationMode;
use crate::error::ValidationErrors;

pub const MIN_PASSWORD_LEN: usize = 8;
pub const MIN_INVITE_CODE_LEN: usize = 6;

static EMAIL_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[^\s@]+@[^\s@]+\.[^\s@]+$").expect("valid email regex"));

/// Field names used as keys in `ValidationErrors`.
pub mod fields {
    pub const EMAIL: &str = "email";
    pub const PASSWORD: &str = "password";
    pub const CONFIRM_PASSWORD: &str = "confirm_password";
    pub const INVITE_CODE: &str = "invite_code";
    pub const DISPLAY_NAME: &str = "display_name";
    pub const HOURLY_RATE: &str = "hourly_rate";
}

/// Trim and uppercase an invite code.
pub fn normalize_code(raw: &str) -> String {
    raw.trim().to_uppercase()
}

/// Whether `code` is long enough to be worth looking up.
pub fn is_plausible_code(code: &str) -> bool {
    code.chars().count() >= MIN_INVITE_CODE_LEN
}

/// Basic `local@domain.tld` shape check.
pub fn is_valid_email(email: &str) -> bool {
    EMAIL_RE.is_match(email.trim())
}

/// Registration form input as typed by the user.
#[derive(Debug, Clone, Copy)]
pub struct RegistrationForm<'a> {
    pub email: &'a str,
    pub password: &'a str,
    pub confirm_password: &'a str,
    pub mode: RegistrationMode,
    pub invite_code: Option<&'a str>,
}

/// Check the registration form. Invite validity against the store is a
/// separate step; this only rejects a missing or too-short code.
pub fn validate_registration(form: &RegistrationForm<'_>) -> Result<(), ValidationErrors> {
    let mut errors = ValidationErrors::new();

    check_email(&mut errors, form.email);

    if form.password.chars().count() < MIN_PASSWORD_LEN {
        errors.add(
            fields::PASSWORD,
            format!("Password must be at least {MIN_PASSWORD_LEN} characters"),
        );
    }
    if form.password != form.confirm_password {
        errors.add(fields::CONFIRM_PASSWORD, "Passwords do not match");
    }

    if form.mode == RegistrationMode::Invite {
        match form.invite_code.map(normalize_code) {
            None => errors.add(fields::INVITE_CODE, "Invite code is required"),
            Some(code) if code.is_empty() => {
                errors.add(fields::INVITE_CODE, "Invite code is required")
            }
            Some(code) if !is_plausible_code(&code) => errors.add(
                fields::INVITE_CODE,
                format!("Invite code must be at least {MIN_INVITE_CODE_LEN} characters"),
            ),
            Some(_) => {}
        }
    }

    errors.into_result()
}

/// Check the sign-in form.
pub fn validate_sign_in(email: &str, password: &str) -> Result<(), ValidationErrors> {
    let mut errors = ValidationErrors::new();
    check_email(&mut errors, email);
    if password.is_empty() {
        errors.add(fields::PASSWORD, "Password is required");
    }
    errors.into_result()
}

fn check_email(errors: &mut ValidationErrors, email: &str) {
    if email.trim().is_empty() {
        errors.add(fields::EMAIL, "Email is required");
    } else if !is_valid_email(email) {
        errors.add(fields::EMAIL, "Please enter a valid email address");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn form<'a>(email: &'a str, password: &'a str, confirm: &'a str) -> RegistrationForm<'a> {
        RegistrationForm {
            email,
            password,
            confirm_password: confirm,
            mode: RegistrationMode::Public,
            invite_code: None,
        }
    }

    #[test]
    fn email_shapes() {
        assert!(is_valid_email("a@example.com"));
        assert!(is_valid_email("  first.last+tag@sub.example.co  "));
        assert!(!is_valid_email("a@example"));
        assert!(!is_valid_email("no-at.example.com"));
        assert!(!is_valid_email("two words@example.com"));
        assert!(!is_valid_email(""));
    }

    #[test]
    fn normalize_trims_and_uppercases() {
        assert_eq!(normalize_code("  studio4821 "), "STUDIO4821");
        assert!(is_plausible_code("ABCDEF"));
        assert!(!is_plausible_code("ABCDE"));
    }

    #[test]
    fn valid_public_form_passes() {
        assert!(validate_registration(&form("a@example.com", "Passw0rd!", "Passw0rd!")).is_ok());
    }

    #[test]
    fn collects_every_field_error() {
        let errors = validate_registration(&form("nope", "short", "different")).unwrap_err();
        assert_eq!(errors.get(fields::EMAIL), Some("Please enter a valid email address"));
        assert_eq!(
            errors.get(fields::PASSWORD),
            Some("Password must be at least 8 characters")
        );
        assert_eq!(errors.get(fields::CONFIRM_PASSWORD), Some("Passwords do not match"));
    }

    #[test]
    fn invite_mode_requires_code() {
        let mut f = form("a@example.com", "Passw0rd!", "Passw0rd!");
        f.mode = RegistrationMode::Invite;
        let errors = validate_registration(&f).unwrap_err();
        assert_eq!(errors.get(fields::INVITE_CODE), Some("Invite code is required"));

        f.invite_code = Some(" abc ");
        let errors = validate_registration(&f).unwrap_err();
        assert_eq!(
            errors.get(fields::INVITE_CODE),
            Some("Invite code must be at least 6 characters")
        );

        f.invite_code = Some("studio4821");
        assert!(validate_registration(&f).is_ok());
    }

    #[test]
    fn public_mode_ignores_invite_code() {
        let mut f = form("a@example.com", "Passw0rd!", "Passw0rd!");
        f.invite_code = Some("x");
        assert!(validate_registration(&f).is_ok());
    }

    #[test]
    fn sign_in_requires_both_fields() {
        let errors = validate_sign_in("", "").unwrap_err();
        assert_eq!(errors.get(fields::EMAIL), Some("Email is required"));
        assert_eq!(errors.get(fields::PASSWORD), Some("Password is required"));
        assert!(validate_sign_in("a@example.com", "x").is_ok());
    }
}
