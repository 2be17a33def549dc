//! Account-deletion cleanup job.
//!
//! Runs when an owner's profile flips `deletionRequested` on. It removes every document
//! under the owner, then the identity record, and reports progress back on the profile.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{error, info, instrument, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeletionStatus {
    Processing,
    Completed,
    Failed,
}

/// Deletion-related fields of an owner profile.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProfileState {
    #[serde(default)]
    pub deletion_requested: bool,
    #[serde(default)]
    pub deletion_status: Option<DeletionStatus>,
}

#[derive(Debug, Error)]
pub enum CleanupError {
    #[error("identity record not found")]
    IdentityNotFound,
    #[error("cleanup backend error: {0}")]
    Backend(String),
}

impl CleanupError {
    pub fn backend(message: impl Into<String>) -> Self {
        Self::Backend(message.into())
    }
}

/// Privileged operations the job needs from the store and identity provider.
#[async_trait]
pub trait CleanupBackend: Send + Sync {
    async fn mark_status(
        &self,
        owner_id: &str,
        status: DeletionStatus,
        error: Option<&str>,
    ) -> Result<(), CleanupError>;

    /// Delete the profile and everything beneath it. Returns the document count.
    async fn delete_owner_documents(&self, owner_id: &str) -> Result<u64, CleanupError>;

    async fn delete_identity(&self, owner_id: &str) -> Result<(), CleanupError>;

    async fn profile_exists(&self, owner_id: &str) -> Result<bool, CleanupError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CleanupOutcome {
    /// The change did not newly request deletion.
    NotTriggered,
    /// A previous run already started or finished.
    AlreadyHandled(DeletionStatus),
    Completed { documents: u64 },
    Failed { error: String },
}

#[instrument(skip(backend, before, after))]
pub async fn process_profile_change(
    backend: &dyn CleanupBackend,
    owner_id: &str,
    before: &ProfileState,
    after: &ProfileState,
) -> CleanupOutcome {
    if !after.deletion_requested || before.deletion_requested {
        return CleanupOutcome::NotTriggered;
    }
    if let Some(status @ (DeletionStatus::Processing | DeletionStatus::Completed)) =
        after.deletion_status
    {
        info!(
            target = "biztrack::cleanup",
            status = ?status,
            "Deletion already handled"
        );
        return CleanupOutcome::AlreadyHandled(status);
    }

    match run(backend, owner_id).await {
        Ok(documents) => {
            info!(target = "biztrack::cleanup", documents, "Account deletion completed");
            CleanupOutcome::Completed { documents }
        }
        Err(err) => {
            let message = err.to_string();
            error!(target = "biztrack::cleanup", error = %message, "Account deletion failed");
            match backend.profile_exists(owner_id).await {
                Ok(true) => {
                    if let Err(mark_err) = backend
                        .mark_status(owner_id, DeletionStatus::Failed, Some(&message))
                        .await
                    {
                        warn!(
                            target = "biztrack::cleanup",
                            error = %mark_err,
                            "Could not record deletion failure"
                        );
                    }
                }
                Ok(false) => {}
                Err(check_err) => warn!(
                    target = "biztrack::cleanup",
                    error = %check_err,
                    "Could not check profile after failure"
                ),
            }
            CleanupOutcome::Failed { error: message }
        }
    }
}

async fn run(backend: &dyn CleanupBackend, owner_id: &str) -> Result<u64, CleanupError> {
    backend
        .mark_status(owner_id, DeletionStatus::Processing, None)
        .await?;

    let documents = backend.delete_owner_documents(owner_id).await?;
    info!(target = "biztrack::cleanup", documents, "Owner data deleted");

    match backend.delete_identity(owner_id).await {
        Ok(()) | Err(CleanupError::IdentityNotFound) => {}
        Err(err) => return Err(err),
    }

    // Deleting the owner's documents normally takes the profile with it.
    if backend.profile_exists(owner_id).await? {
        backend
            .mark_status(owner_id, DeletionStatus::Completed, None)
            .await?;
    }
    Ok(documents)
}
