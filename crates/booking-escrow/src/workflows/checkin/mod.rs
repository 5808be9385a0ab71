//! On-site verification gate: a client-issued one-time code plus a GPS proximity check.
//!
//! The gate only produces verdicts and updates its own attempt bookkeeping. Moving the
//! booking into `checked_in` is left to the booking engine.

mod location;
mod otp;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub use location::{
    acquire_fix, GeoPoint, LocationError, LocationSource, ReportedLocation, ServiceLocation,
};

use crate::workflows::booking::domain::BookingId;
use crate::workflows::policy::CheckInPolicy;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptOutcome {
    Pending,
    Passed,
    Expired,
    LockedOut,
    Superseded,
}

/// One issued code and the submissions made against it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckInAttempt {
    pub code_hash: String,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub failed_attempts: u32,
    pub locked_until: Option<DateTime<Utc>>,
    pub outcome: AttemptOutcome,
}

/// Per-booking check-in bookkeeping persisted with the booking record.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CheckInState {
    pub current: Option<CheckInAttempt>,
    pub history: Vec<CheckInAttempt>,
    pub last_verdict: Option<CheckInVerdict>,
}

/// Plaintext code handed back to the client exactly once.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IssuedCode {
    pub code: String,
    pub expires_at: DateTime<Utc>,
}

/// The stable set of denial reasons shown to clients and providers.
#[derive(Debug, Clone, PartialEq, thiserror::Error, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum VerificationFailure {
    #[error("no check-in code has been issued")]
    NoActiveCode,
    #[error("check-in code expired")]
    CodeExpired,
    #[error("check-in code does not match ({remaining_attempts} attempt(s) left)")]
    CodeMismatch { remaining_attempts: u32 },
    #[error("maximum check-in attempts reached")]
    MaxAttemptsReached { retry_after: Option<DateTime<Utc>> },
    #[error("provider is {distance_meters:.0}m from the job site (limit {radius_meters:.0}m)")]
    LocationTooFar {
        distance_meters: f64,
        radius_meters: f64,
    },
    #[error("provider location unavailable")]
    LocationUnavailable,
}

impl VerificationFailure {
    pub const fn code(&self) -> &'static str {
        match self {
            Self::NoActiveCode => "no_active_code",
            Self::CodeExpired => "code_expired",
            Self::CodeMismatch { .. } => "code_mismatch",
            Self::MaxAttemptsReached { .. } => "max_attempts_reached",
            Self::LocationTooFar { .. } => "location_too_far",
            Self::LocationUnavailable => "location_unavailable",
        }
    }
}

/// Single PASS/FAIL decision plus the measured distance for observability.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckInVerdict {
    pub passed: bool,
    pub distance_meters: Option<f64>,
    pub failure: Option<VerificationFailure>,
    pub evaluated_at: DateTime<Utc>,
}

impl CheckInVerdict {
    fn pass(distance_meters: Option<f64>, at: DateTime<Utc>) -> Self {
        Self {
            passed: true,
            distance_meters,
            failure: None,
            evaluated_at: at,
        }
    }

    fn fail(
        failure: VerificationFailure,
        distance_meters: Option<f64>,
        at: DateTime<Utc>,
    ) -> Self {
        Self {
            passed: false,
            distance_meters,
            failure: Some(failure),
            evaluated_at: at,
        }
    }
}

/// What the provider submitted at the door.
#[derive(Debug, Clone)]
pub struct CheckInSubmission<'a> {
    pub code: &'a str,
    pub fix: Option<GeoPoint>,
}

#[derive(Debug, Clone)]
pub struct CheckInGate {
    policy: CheckInPolicy,
}

impl CheckInGate {
    pub fn new(policy: CheckInPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &CheckInPolicy {
        &self.policy
    }

    /// Issue a new code, invalidating any earlier one. Refused while a lockout is running.
    pub fn issue(
        &self,
        state: &mut CheckInState,
        booking_id: &BookingId,
        now: DateTime<Utc>,
    ) -> Result<IssuedCode, VerificationFailure> {
        if let Some(until) = state
            .current
            .as_ref()
            .and_then(|attempt| attempt.locked_until)
            .filter(|until| *until > now)
        {
            return Err(VerificationFailure::MaxAttemptsReached {
                retry_after: Some(until),
            });
        }

        if let Some(mut previous) = state.current.take() {
            if previous.outcome == AttemptOutcome::Pending {
                previous.outcome = AttemptOutcome::Superseded;
            }
            state.history.push(previous);
        }

        let code = otp::generate_code();
        let expires_at = now + self.policy.otp_expiry();
        state.current = Some(CheckInAttempt {
            code_hash: otp::hash_code(booking_id, &code),
            issued_at: now,
            expires_at,
            failed_attempts: 0,
            locked_until: None,
            outcome: AttemptOutcome::Pending,
        });

        Ok(IssuedCode { code, expires_at })
    }

    /// Run both checks. `site` of `None` skips the GPS check entirely.
    pub fn evaluate(
        &self,
        state: &mut CheckInState,
        booking_id: &BookingId,
        submission: &CheckInSubmission<'_>,
        site: Option<&ServiceLocation>,
        now: DateTime<Utc>,
    ) -> CheckInVerdict {
        let verdict = match self.check_code(state, booking_id, submission.code, now) {
            Err(failure) => CheckInVerdict::fail(failure, None, now),
            Ok(()) => self.check_location(submission.fix, site, now),
        };

        if verdict.passed {
            if let Some(attempt) = state.current.as_mut() {
                attempt.outcome = AttemptOutcome::Passed;
            }
        }
        state.last_verdict = Some(verdict.clone());
        verdict
    }

    fn check_code(
        &self,
        state: &mut CheckInState,
        booking_id: &BookingId,
        submitted: &str,
        now: DateTime<Utc>,
    ) -> Result<(), VerificationFailure> {
        let max_attempts = self.policy.max_attempts;
        let attempt = match state.current.as_mut() {
            Some(attempt) if attempt.outcome != AttemptOutcome::Passed => attempt,
            _ => return Err(VerificationFailure::NoActiveCode),
        };

        if attempt.failed_attempts >= max_attempts {
            return Err(VerificationFailure::MaxAttemptsReached {
                retry_after: attempt.locked_until.filter(|until| *until > now),
            });
        }

        if now >= attempt.expires_at {
            attempt.outcome = AttemptOutcome::Expired;
            return Err(VerificationFailure::CodeExpired);
        }

        let submitted = submitted.trim();
        if otp::is_well_formed(submitted) && otp::matches(booking_id, submitted, &attempt.code_hash)
        {
            return Ok(());
        }

        attempt.failed_attempts += 1;
        if attempt.failed_attempts >= max_attempts {
            attempt.locked_until = Some(now + self.policy.cooldown());
            attempt.outcome = AttemptOutcome::LockedOut;
        }
        Err(VerificationFailure::CodeMismatch {
            remaining_attempts: max_attempts - attempt.failed_attempts,
        })
    }

    fn check_location(
        &self,
        fix: Option<GeoPoint>,
        site: Option<&ServiceLocation>,
        now: DateTime<Utc>,
    ) -> CheckInVerdict {
        let Some(site) = site else {
            return CheckInVerdict::pass(None, now);
        };
        let Some(fix) = fix else {
            return CheckInVerdict::fail(VerificationFailure::LocationUnavailable, None, now);
        };

        let distance = site.point.distance_meters(&fix);
        let radius = site.radius_or(self.policy.radius_meters);
        if distance <= radius {
            CheckInVerdict::pass(Some(distance), now)
        } else {
            CheckInVerdict::fail(
                VerificationFailure::LocationTooFar {
                    distance_meters: distance,
                    radius_meters: radius,
                },
                Some(distance),
                now,
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflows::policy::EngineConfig;
    use chrono::{Duration, TimeZone};

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 2, 9, 0, 0).single().expect("valid time")
    }

    fn booking() -> BookingId {
        BookingId("bkg-gate".to_string())
    }

    fn gate() -> CheckInGate {
        CheckInGate::new(EngineConfig::standard().check_in)
    }

    fn site() -> ServiceLocation {
        ServiceLocation {
            point: GeoPoint::new(6.4281, 3.4219),
            radius_meters: None,
        }
    }

    fn submit<'a>(code: &'a str, fix: Option<GeoPoint>) -> CheckInSubmission<'a> {
        CheckInSubmission { code, fix }
    }

    #[test]
    fn passes_with_matching_code_on_site() {
        let gate = gate();
        let mut state = CheckInState::default();
        let issued = gate.issue(&mut state, &booking(), now()).expect("issues");
        let fix = site().point.offset_north(20.0);

        let verdict = gate.evaluate(
            &mut state,
            &booking(),
            &submit(&issued.code, Some(fix)),
            Some(&site()),
            now(),
        );

        assert!(verdict.passed);
        let distance = verdict.distance_meters.expect("distance measured");
        assert!((distance - 20.0).abs() < 0.01);
        assert_eq!(
            state.current.as_ref().map(|attempt| attempt.outcome),
            Some(AttemptOutcome::Passed)
        );
    }

    #[test]
    fn radius_boundary_is_inclusive() {
        let gate = gate();
        let at_edge = site().point.offset_north(120.0);
        let edge_distance = site().point.distance_meters(&at_edge);
        let exact_site = ServiceLocation {
            radius_meters: Some(edge_distance),
            ..site()
        };

        let mut state = CheckInState::default();
        let issued = gate.issue(&mut state, &booking(), now()).expect("issues");
        let verdict = gate.evaluate(
            &mut state,
            &booking(),
            &submit(&issued.code, Some(at_edge)),
            Some(&exact_site),
            now(),
        );
        assert!(verdict.passed, "provider exactly at the radius passes");

        let mut state = CheckInState::default();
        let issued = gate.issue(&mut state, &booking(), now()).expect("issues");
        let beyond = site().point.offset_north(121.0);
        let verdict = gate.evaluate(
            &mut state,
            &booking(),
            &submit(&issued.code, Some(beyond)),
            Some(&exact_site),
            now(),
        );
        assert!(!verdict.passed);
        assert!(matches!(
            verdict.failure,
            Some(VerificationFailure::LocationTooFar { .. })
        ));
    }

    #[test]
    fn missing_site_skips_gps_check() {
        let gate = gate();
        let mut state = CheckInState::default();
        let issued = gate.issue(&mut state, &booking(), now()).expect("issues");
        let verdict = gate.evaluate(
            &mut state,
            &booking(),
            &submit(&issued.code, None),
            None,
            now(),
        );
        assert!(verdict.passed);
        assert_eq!(verdict.distance_meters, None);
    }

    #[test]
    fn missing_fix_fails_when_site_is_known() {
        let gate = gate();
        let mut state = CheckInState::default();
        let issued = gate.issue(&mut state, &booking(), now()).expect("issues");
        let verdict = gate.evaluate(
            &mut state,
            &booking(),
            &submit(&issued.code, None),
            Some(&site()),
            now(),
        );
        assert_eq!(
            verdict.failure,
            Some(VerificationFailure::LocationUnavailable)
        );
    }

    #[test]
    fn expired_code_is_rejected() {
        let gate = gate();
        let mut state = CheckInState::default();
        let issued = gate.issue(&mut state, &booking(), now()).expect("issues");
        let later = issued.expires_at + Duration::seconds(1);
        let verdict = gate.evaluate(
            &mut state,
            &booking(),
            &submit(&issued.code, None),
            None,
            later,
        );
        assert_eq!(verdict.failure, Some(VerificationFailure::CodeExpired));
    }

    #[test]
    fn lockout_rejects_correct_code_until_cooldown() {
        let gate = gate();
        let max_attempts = gate.policy().max_attempts;
        let mut state = CheckInState::default();
        let issued = gate.issue(&mut state, &booking(), now()).expect("issues");
        let wrong = if issued.code == "000000" { "111111" } else { "000000" };

        for attempt in 1..=max_attempts {
            let verdict =
                gate.evaluate(&mut state, &booking(), &submit(wrong, None), None, now());
            assert_eq!(
                verdict.failure,
                Some(VerificationFailure::CodeMismatch {
                    remaining_attempts: max_attempts - attempt
                })
            );
        }

        let verdict = gate.evaluate(
            &mut state,
            &booking(),
            &submit(&issued.code, None),
            None,
            now() + Duration::minutes(1),
        );
        assert!(matches!(
            verdict.failure,
            Some(VerificationFailure::MaxAttemptsReached {
                retry_after: Some(_)
            })
        ));

        assert!(gate
            .issue(&mut state, &booking(), now() + Duration::minutes(1))
            .is_err());

        let after_cooldown = now() + gate.policy().cooldown() + Duration::seconds(1);
        let reissued = gate
            .issue(&mut state, &booking(), after_cooldown)
            .expect("re-issue after cooldown");
        let verdict = gate.evaluate(
            &mut state,
            &booking(),
            &submit(&reissued.code, None),
            None,
            after_cooldown,
        );
        assert!(verdict.passed);
        assert_eq!(state.history.len(), 1);
    }

    #[test]
    fn new_code_invalidates_previous_one() {
        let gate = gate();
        let mut state = CheckInState::default();
        let first = gate.issue(&mut state, &booking(), now()).expect("issues");
        let second = gate.issue(&mut state, &booking(), now()).expect("re-issues");
        assert_eq!(state.history[0].outcome, AttemptOutcome::Superseded);

        if first.code != second.code {
            let verdict = gate.evaluate(
                &mut state,
                &booking(),
                &submit(&first.code, None),
                None,
                now(),
            );
            assert!(!verdict.passed);
        }
        let verdict = gate.evaluate(
            &mut state,
            &booking(),
            &submit(&second.code, None),
            None,
            now(),
        );
        assert!(verdict.passed);
    }
}
