//! ---
//! bastion_section: "05-second-factor"
//! bastion_subsection: "module"
//! bastion_type: "source"
//! bastion_scope: "code"
//! bastion_description: "Time-based one-time passwords and MFA enrollment."
//! bastion_version: "v0.0.0-prealpha"
//! bastion_owner: "tbd"
//! ---
use std::collections::HashMap;

use bastion_common::config::TotpConfig;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

use crate::totp;

/// Identifier for a user account.
pub type UserId = String;

#[derive(Debug, Clone)]
struct Enrollment {
    secret: String,
    confirmed: bool,
    enrolled_at: DateTime<Utc>,
}

/// Secret handed to the user once, at enrollment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MfaEnrollment {
    /// Enrolled user.
    pub user_id: UserId,
    /// Base32 secret to load into an authenticator.
    pub secret: String,
    /// `otpauth://` form of the secret.
    pub provisioning_uri: String,
    /// When the enrollment was started.
    pub enrolled_at: DateTime<Utc>,
}

/// Errors returned by the MFA registry.
#[derive(Debug, Error)]
pub enum MfaError {
    /// The user has no enrollment (or only an unconfirmed one, for verification).
    #[error("mfa not enrolled for user {0}")]
    NotEnrolled(UserId),
    /// The user already has an active second factor.
    #[error("mfa already enabled for user {0}")]
    AlreadyEnabled(UserId),
    /// The supplied code did not verify.
    #[error("invalid one-time code")]
    InvalidCode,
}

/// Per-user TOTP enrollment and forced-MFA flags.
///
/// `is_enabled` is the source of the `mfaEnabled` subject attribute; `is_required`
/// additionally covers users forced into MFA by the `require_mfa` response action.
#[derive(Debug)]
pub struct MfaRegistry {
    enrollments: RwLock<HashMap<UserId, Enrollment>>,
    forced: RwLock<HashMap<UserId, DateTime<Utc>>>,
    issuer: String,
    tolerance_steps: u32,
}

impl MfaRegistry {
    /// Registry using the `[totp]` settings.
    pub fn new(config: &TotpConfig) -> Self {
        Self {
            enrollments: RwLock::new(HashMap::new()),
            forced: RwLock::new(HashMap::new()),
            issuer: config.issuer.clone(),
            tolerance_steps: config.tolerance_steps,
        }
    }

    /// Start (or restart) enrollment. The factor is inactive until [`Self::confirm`].
    pub fn enroll(&self, user_id: &str, now: DateTime<Utc>) -> Result<MfaEnrollment, MfaError> {
        let mut enrollments = self.enrollments.write();
        if enrollments.get(user_id).is_some_and(|e| e.confirmed) {
            return Err(MfaError::AlreadyEnabled(user_id.to_owned()));
        }
        let secret = totp::generate_secret();
        enrollments.insert(
            user_id.to_owned(),
            Enrollment {
                secret: secret.clone(),
                confirmed: false,
                enrolled_at: now,
            },
        );
        Ok(MfaEnrollment {
            user_id: user_id.to_owned(),
            provisioning_uri: totp::provisioning_uri(&secret, user_id, &self.issuer),
            secret,
            enrolled_at: now,
        })
    }

    /// Activate a pending enrollment by proving possession of the secret.
    pub fn confirm(&self, user_id: &str, code: &str, now: DateTime<Utc>) -> Result<(), MfaError> {
        let mut enrollments = self.enrollments.write();
        let enrollment = enrollments
            .get_mut(user_id)
            .ok_or_else(|| MfaError::NotEnrolled(user_id.to_owned()))?;
        if enrollment.confirmed {
            return Err(MfaError::AlreadyEnabled(user_id.to_owned()));
        }
        if !totp::verify_code(&enrollment.secret, code, now, self.tolerance_steps) {
            return Err(MfaError::InvalidCode);
        }
        enrollment.confirmed = true;
        info!(
            user = user_id,
            enrolled_at = %enrollment.enrolled_at,
            "mfa enabled"
        );
        Ok(())
    }

    /// Check a code for an active enrollment.
    pub fn verify(&self, user_id: &str, code: &str, now: DateTime<Utc>) -> Result<bool, MfaError> {
        let enrollments = self.enrollments.read();
        let enrollment = enrollments
            .get(user_id)
            .filter(|e| e.confirmed)
            .ok_or_else(|| MfaError::NotEnrolled(user_id.to_owned()))?;
        Ok(totp::verify_code(
            &enrollment.secret,
            code,
            now,
            self.tolerance_steps,
        ))
    }

    /// Remove the user's second factor. Returns `true` if one existed.
    pub fn disable(&self, user_id: &str) -> bool {
        let removed = self.enrollments.write().remove(user_id).is_some();
        if removed {
            info!(user = user_id, "mfa disabled");
        }
        removed
    }

    /// Whether the user has a confirmed second factor.
    pub fn is_enabled(&self, user_id: &str) -> bool {
        self.enrollments
            .read()
            .get(user_id)
            .is_some_and(|e| e.confirmed)
    }

    /// Require MFA for the user from now on. Returns `false` if already forced.
    pub fn force(&self, user_id: &str, now: DateTime<Utc>) -> bool {
        let mut forced = self.forced.write();
        if forced.contains_key(user_id) {
            return false;
        }
        forced.insert(user_id.to_owned(), now);
        info!(user = user_id, "mfa forced");
        true
    }

    /// Whether MFA was forced on the user.
    pub fn is_forced(&self, user_id: &str) -> bool {
        self.forced.read().contains_key(user_id)
    }

    /// Lift a forced-MFA flag.
    pub fn clear_forced(&self, user_id: &str) -> bool {
        self.forced.write().remove(user_id).is_some()
    }

    /// Users currently forced into MFA, with the time they were flagged.
    pub fn forced_users(&self) -> Vec<(UserId, DateTime<Utc>)> {
        let mut users: Vec<_> = self
            .forced
            .read()
            .iter()
            .map(|(user, at)| (user.clone(), *at))
            .collect();
        users.sort();
        users
    }

    /// Whether a login for the user must present a second factor.
    pub fn is_required(&self, user_id: &str) -> bool {
        self.is_enabled(user_id) || self.is_forced(user_id)
    }
}
