//! Versioned engine policy: tier table, fee schedule, and the timing dials used by the
//! check-in gate, the rectification workflow, and the booking state machine.

use chrono::Duration;
use serde::{Deserialize, Serialize};

/// Service complexity tier. Higher tiers hold a larger share of the price for longer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum ServiceTier {
    One,
    Two,
    Three,
    Four,
}

impl ServiceTier {
    pub const fn ordered() -> [Self; 4] {
        [Self::One, Self::Two, Self::Three, Self::Four]
    }

    pub const fn number(self) -> u8 {
        match self {
            Self::One => 1,
            Self::Two => 2,
            Self::Three => 3,
            Self::Four => 4,
        }
    }

    /// Only the largest projects pay out in phases.
    pub const fn uses_milestones(self) -> bool {
        matches!(self, Self::Four)
    }

    const fn index(self) -> usize {
        self.number() as usize - 1
    }
}

impl TryFrom<u8> for ServiceTier {
    type Error = PolicyError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::One),
            2 => Ok(Self::Two),
            3 => Ok(Self::Three),
            4 => Ok(Self::Four),
            other => Err(PolicyError::UnknownTier(other)),
        }
    }
}

impl From<ServiceTier> for u8 {
    fn from(value: ServiceTier) -> Self {
        value.number()
    }
}

/// One row of the tier table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierPolicy {
    pub tier: ServiceTier,
    pub commitment_fee_percent: u32,
    pub observation_days: u32,
    #[serde(default)]
    pub milestone_percents: Vec<u32>,
}

impl TierPolicy {
    pub fn observation_window(&self) -> Duration {
        Duration::days(i64::from(self.observation_days))
    }
}

/// Stage used to price a cancellation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CancellationStage {
    Before24h,
    Within24h,
    AfterProviderConfirmed,
    AfterEnRoute,
    AfterCheckedIn,
}

impl CancellationStage {
    pub const fn label(self) -> &'static str {
        match self {
            Self::Before24h => "before_24h",
            Self::Within24h => "within_24h",
            Self::AfterProviderConfirmed => "after_provider_confirmed",
            Self::AfterEnRoute => "after_en_route",
            Self::AfterCheckedIn => "after_checked_in",
        }
    }
}

/// Tier-independent fees, expressed as a percentage of the commitment fee.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeeSchedule {
    pub before_24h_percent: u32,
    pub within_24h_percent: u32,
    pub after_provider_confirmed_percent: u32,
    pub after_en_route_percent: u32,
    pub after_checked_in_percent: u32,
    pub provider_no_show_forfeit_percent: u32,
    pub client_no_show_forfeit_percent: u32,
}

impl FeeSchedule {
    pub fn cancellation_percent(&self, stage: CancellationStage) -> u32 {
        match stage {
            CancellationStage::Before24h => self.before_24h_percent,
            CancellationStage::Within24h => self.within_24h_percent,
            CancellationStage::AfterProviderConfirmed => self.after_provider_confirmed_percent,
            CancellationStage::AfterEnRoute => self.after_en_route_percent,
            CancellationStage::AfterCheckedIn => self.after_checked_in_percent,
        }
    }

    pub fn cancellation_fee(&self, stage: CancellationStage, commitment_fee: u64) -> u64 {
        percent_of(commitment_fee, self.cancellation_percent(stage))
    }

    fn percents(&self) -> [(&'static str, u32); 7] {
        [
            ("before_24h_percent", self.before_24h_percent),
            ("within_24h_percent", self.within_24h_percent),
            (
                "after_provider_confirmed_percent",
                self.after_provider_confirmed_percent,
            ),
            ("after_en_route_percent", self.after_en_route_percent),
            ("after_checked_in_percent", self.after_checked_in_percent),
            (
                "provider_no_show_forfeit_percent",
                self.provider_no_show_forfeit_percent,
            ),
            (
                "client_no_show_forfeit_percent",
                self.client_no_show_forfeit_percent,
            ),
        ]
    }
}

/// Dials for the OTP and GPS checks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckInPolicy {
    pub otp_expiry_minutes: u32,
    pub max_attempts: u32,
    pub cooldown_minutes: u32,
    pub radius_meters: f64,
    pub gps_timeout_ms: u64,
    pub gps_max_retries: u32,
}

impl CheckInPolicy {
    pub fn otp_expiry(&self) -> Duration {
        Duration::minutes(i64::from(self.otp_expiry_minutes))
    }

    pub fn cooldown(&self) -> Duration {
        Duration::minutes(i64::from(self.cooldown_minutes))
    }

    pub fn gps_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.gps_timeout_ms)
    }
}

/// SLA windows for the rectification sub-workflow.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RectificationPolicy {
    pub provider_response_hours: u32,
    pub fix_deadline_hours: u32,
    pub mini_observation_days: u32,
    pub max_attempts: u32,
}

impl RectificationPolicy {
    pub fn provider_response_window(&self) -> Duration {
        Duration::hours(i64::from(self.provider_response_hours))
    }

    pub fn fix_window(&self) -> Duration {
        Duration::hours(i64::from(self.fix_deadline_hours))
    }

    pub fn mini_observation_window(&self) -> Duration {
        Duration::days(i64::from(self.mini_observation_days))
    }
}

/// Timers owned by the booking state machine itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookingPolicy {
    pub provider_confirmation_hours: u32,
    pub no_show_grace_minutes: u32,
}

impl BookingPolicy {
    pub fn provider_confirmation_window(&self) -> Duration {
        Duration::hours(i64::from(self.provider_confirmation_hours))
    }

    pub fn no_show_grace(&self) -> Duration {
        Duration::minutes(i64::from(self.no_show_grace_minutes))
    }
}

/// Complete policy snapshot. Bookings remember the `version` they were funded under.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    pub version: u32,
    pub tiers: [TierPolicy; 4],
    pub fees: FeeSchedule,
    pub check_in: CheckInPolicy,
    pub rectification: RectificationPolicy,
    pub booking: BookingPolicy,
}

impl EngineConfig {
    pub fn standard() -> Self {
        Self {
            version: 1,
            tiers: [
                TierPolicy {
                    tier: ServiceTier::One,
                    commitment_fee_percent: 20,
                    observation_days: 3,
                    milestone_percents: Vec::new(),
                },
                TierPolicy {
                    tier: ServiceTier::Two,
                    commitment_fee_percent: 25,
                    observation_days: 5,
                    milestone_percents: Vec::new(),
                },
                TierPolicy {
                    tier: ServiceTier::Three,
                    commitment_fee_percent: 30,
                    observation_days: 7,
                    milestone_percents: Vec::new(),
                },
                TierPolicy {
                    tier: ServiceTier::Four,
                    commitment_fee_percent: 15,
                    observation_days: 14,
                    milestone_percents: vec![30, 40, 30],
                },
            ],
            fees: FeeSchedule {
                before_24h_percent: 0,
                within_24h_percent: 10,
                after_provider_confirmed_percent: 25,
                after_en_route_percent: 50,
                after_checked_in_percent: 100,
                provider_no_show_forfeit_percent: 100,
                client_no_show_forfeit_percent: 25,
            },
            check_in: CheckInPolicy {
                otp_expiry_minutes: 15,
                max_attempts: 3,
                cooldown_minutes: 30,
                radius_meters: 200.0,
                gps_timeout_ms: 10_000,
                gps_max_retries: 3,
            },
            rectification: RectificationPolicy {
                provider_response_hours: 24,
                fix_deadline_hours: 72,
                mini_observation_days: 2,
                max_attempts: 2,
            },
            booking: BookingPolicy {
                provider_confirmation_hours: 24,
                no_show_grace_minutes: 30,
            },
        }
    }

    pub fn tier(&self, tier: ServiceTier) -> &TierPolicy {
        &self.tiers[tier.index()]
    }

    pub fn validate(&self) -> Result<(), PolicyError> {
        for (position, row) in self.tiers.iter().enumerate() {
            if row.tier.index() != position {
                return Err(PolicyError::TierOutOfPosition {
                    tier: row.tier.number(),
                    position: position + 1,
                });
            }
            if row.commitment_fee_percent > 100 {
                return Err(PolicyError::PercentOutOfRange {
                    field: "commitment_fee_percent",
                    value: row.commitment_fee_percent,
                });
            }
            if row.observation_days == 0 {
                return Err(PolicyError::ZeroWindow("observation_days"));
            }

            match (row.tier.uses_milestones(), row.milestone_percents.is_empty()) {
                (true, true) => return Err(PolicyError::MissingMilestones),
                (false, false) => {
                    return Err(PolicyError::UnexpectedMilestones(row.tier.number()))
                }
                (true, false) => {
                    let sum: u32 = row.milestone_percents.iter().sum();
                    if sum != 100 {
                        return Err(PolicyError::MilestoneSum { sum });
                    }
                }
                (false, true) => {}
            }
        }

        for (field, value) in self.fees.percents() {
            if value > 100 {
                return Err(PolicyError::PercentOutOfRange { field, value });
            }
        }

        let windows = [
            ("otp_expiry_minutes", self.check_in.otp_expiry_minutes),
            ("max_attempts", self.check_in.max_attempts),
            (
                "provider_response_hours",
                self.rectification.provider_response_hours,
            ),
            ("fix_deadline_hours", self.rectification.fix_deadline_hours),
            (
                "mini_observation_days",
                self.rectification.mini_observation_days,
            ),
            (
                "provider_confirmation_hours",
                self.booking.provider_confirmation_hours,
            ),
        ];
        if let Some((field, _)) = windows.iter().find(|(_, value)| *value == 0) {
            return Err(PolicyError::ZeroWindow(*field));
        }

        if !(self.check_in.radius_meters.is_finite() && self.check_in.radius_meters > 0.0) {
            return Err(PolicyError::InvalidRadius);
        }

        Ok(())
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self::standard()
    }
}

/// Integer percentage of an amount in minor units, rounded half-up.
pub fn percent_of(amount: u64, percent: u32) -> u64 {
    let scaled = u128::from(amount) * u128::from(percent) + 50;
    (scaled / 100) as u64
}

/// Policy validation failures.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum PolicyError {
    #[error("tier {0} is not defined (expected 1-4)")]
    UnknownTier(u8),
    #[error("tier {tier} listed at position {position}")]
    TierOutOfPosition { tier: u8, position: usize },
    #[error("{field} must be within 0-100, found {value}")]
    PercentOutOfRange { field: &'static str, value: u32 },
    #[error("tier 4 requires milestone percentages")]
    MissingMilestones,
    #[error("tier {0} does not pay out in milestones")]
    UnexpectedMilestones(u8),
    #[error("milestone percentages must sum to 100, found {sum}")]
    MilestoneSum { sum: u32 },
    #[error("{0} must be greater than zero")]
    ZeroWindow(&'static str),
    #[error("check-in radius must be a positive distance")]
    InvalidRadius,
}
