//! Account registration and invite redemption.
//!
//! Signup stages a `PendingRegistration` in the caller's client context;
//! the first path to observe a live session (sign-in or the emailed-link
//! callback) finalizes it into a profile and consumes the invite.

pub mod callback;
pub mod finalize;
pub mod invite;
pub mod login;
pub mod model;
pub mod pending;
pub mod profile;
pub mod registrar;
pub mod validation;

pub use callback::{CallbackParams, CallbackPhase, ConfirmationHandler, Navigation};
pub use finalize::{FinalizeOutcome, Finalizer, InviteResult, ProfileResult};
pub use invite::{InviteCheck, InviteIssuer, InviteValidator};
pub use login::{SignInFlow, SignInOutcome};
pub use pending::{PendingRegistrationStore, StagedRegistration};
pub use profile::ProfileMaterializer;
pub use registrar::{Registrar, RegistrationOutcome, RegistrationRequest};
