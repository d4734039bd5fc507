//! Pending-registration store.
//!
//! Holds at most one `PendingRegistration` per client context. Every write
//! bumps a monotonic generation; consumers that did remote work between
//! reading and clearing use `clear_if_current` so they never delete a
//! registration staged by someone else in the meantime.

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::model::PendingRegistration;
use crate::error::StorageError;
use crate::local::ClientContext;
use crate::local::context::slot_keys;

/// What is persisted in the slot.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct PendingEnvelope {
    generation: u64,
    registration: PendingRegistration,
}

/// A pending registration together with the generation it was written under.
#[derive(Debug, Clone, PartialEq)]
pub struct StagedRegistration {
    pub generation: u64,
    pub registration: PendingRegistration,
}

/// Single-slot store for the registration in flight in one client context.
pub struct PendingRegistrationStore {
    context: ClientContext,
}

impl PendingRegistrationStore {
    pub fn new(context: ClientContext) -> Self {
        Self { context }
    }

    /// Stage `registration`, replacing whatever was there. Returns the new generation.
    pub async fn stage(&self, registration: PendingRegistration) -> Result<u64, StorageError> {
        let _guard = self.context.lock().await;

        let counter = self.context.slot::<u64>(slot_keys::PENDING_GENERATION);
        let generation = match counter.get().await {
            Ok(current) => current.unwrap_or(0) + 1,
            Err(StorageError::Corrupt { reason, .. }) => {
                warn!(context = %self.context.id(), reason = %reason, "Resetting corrupt generation counter");
                1
            }
            Err(e) => return Err(e),
        };
        counter.set(&generation).await?;

        let replaced = self.envelope_slot().get().await.ok().flatten();
        if let Some(previous) = replaced {
            info!(
                context = %self.context.id(),
                previous_generation = previous.generation,
                "Replacing earlier pending registration"
            );
        }

        self.envelope_slot()
            .set(&PendingEnvelope {
                generation,
                registration,
            })
            .await?;

        debug!(context = %self.context.id(), generation, "Pending registration staged");
        Ok(generation)
    }

    /// Read the pending registration without removing it.
    pub async fn peek(&self) -> Result<Option<StagedRegistration>, StorageError> {
        let _guard = self.context.lock().await;
        self.read_locked().await
    }

    /// Read and remove in one step.
    pub async fn take(&self) -> Result<Option<PendingRegistration>, StorageError> {
        let _guard = self.context.lock().await;
        let staged = self.read_locked().await?;
        if staged.is_some() {
            self.envelope_slot().remove().await?;
        }
        Ok(staged.map(|s| s.registration))
    }

    /// Remove the slot only if it still holds `generation`.
    ///
    /// Returns `false` (and leaves the slot alone) when it is empty or was
    /// overwritten by a later write.
    pub async fn clear_if_current(&self, generation: u64) -> Result<bool, StorageError> {
        let _guard = self.context.lock().await;
        match self.read_locked().await? {
            Some(staged) if staged.generation == generation => {
                self.envelope_slot().remove().await?;
                debug!(context = %self.context.id(), generation, "Pending registration cleared");
                Ok(true)
            }
            Some(staged) => {
                warn!(
                    context = %self.context.id(),
                    expected = generation,
                    found = staged.generation,
                    "Pending registration changed since it was read; leaving it in place"
                );
                Ok(false)
            }
            None => Ok(false),
        }
    }

    fn envelope_slot(&self) -> crate::local::Slot<PendingEnvelope> {
        self.context.slot(slot_keys::PENDING_REGISTRATION)
    }

    async fn read_locked(&self) -> Result<Option<StagedRegistration>, StorageError> {
        match self.envelope_slot().get().await {
            Ok(envelope) => Ok(envelope.map(|e| StagedRegistration {
                generation: e.generation,
                registration: e.registration,
            })),
            Err(StorageError::Corrupt { reason, .. }) => {
                warn!(context = %self.context.id(), reason = %reason, "Discarding unreadable pending registration");
                self.envelope_slot().remove().await?;
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }
}
