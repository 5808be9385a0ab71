//! Escrow ledger for a single booking.
//!
//! Every money movement goes through the operations on [`EscrowAccount`]. Each successful
//! movement appends a [`LedgerEntry`] which is the source of truth for the payment rail;
//! the rail's acknowledgement is recorded later and never gates a status change.

mod milestones;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub use milestones::{released_in_order, Milestone, MilestoneId, MilestoneStatus};

use crate::workflows::booking::domain::BookingId;
use crate::workflows::policy::{percent_of, ServiceTier, TierPolicy};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EscrowStatus {
    Held,
    CommitmentReleased,
    ObservationActive,
    MilestonePartial,
    Frozen,
    Released,
    AutoReleased,
    Refunded,
}

impl EscrowStatus {
    pub const fn label(self) -> &'static str {
        match self {
            Self::Held => "held",
            Self::CommitmentReleased => "commitment_released",
            Self::ObservationActive => "observation_active",
            Self::MilestonePartial => "milestone_partial",
            Self::Frozen => "frozen",
            Self::Released => "released",
            Self::AutoReleased => "auto_released",
            Self::Refunded => "refunded",
        }
    }

    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Released | Self::AutoReleased | Self::Refunded)
    }
}

/// Who receives a ledger movement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Payee {
    Provider,
    Client,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MovementReason {
    CommitmentFee,
    MilestoneApproved,
    ObservationElapsed,
    FixAccepted,
    CancellationFee,
    CancellationRefund,
    NoShowRefund,
    NoShowPenalty,
    AdminRelease,
    AdminRefund,
    EscalationRuling,
}

impl MovementReason {
    pub const fn label(self) -> &'static str {
        match self {
            Self::CommitmentFee => "commitment_fee",
            Self::MilestoneApproved => "milestone_approved",
            Self::ObservationElapsed => "observation_elapsed",
            Self::FixAccepted => "fix_accepted",
            Self::CancellationFee => "cancellation_fee",
            Self::CancellationRefund => "cancellation_refund",
            Self::NoShowRefund => "no_show_refund",
            Self::NoShowPenalty => "no_show_penalty",
            Self::AdminRelease => "admin_release",
            Self::AdminRefund => "admin_refund",
            Self::EscalationRuling => "escalation_ruling",
        }
    }

    /// Balance releases driven by the observation timer settle as `auto_released`.
    const fn settles_as(self) -> EscrowStatus {
        match self {
            Self::ObservationElapsed => EscrowStatus::AutoReleased,
            _ => EscrowStatus::Released,
        }
    }
}

/// Distinguishes the normal gated path from an audited admin override.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Authority {
    Standard,
    Override,
}

/// One committed money movement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub reference: String,
    pub payee: Payee,
    pub amount: u64,
    pub reason: MovementReason,
    pub recorded_at: DateTime<Utc>,
    pub acknowledged_at: Option<DateTime<Utc>>,
}

/// Monetary state of one booking.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EscrowAccount {
    pub booking_id: BookingId,
    pub tier: ServiceTier,
    pub config_version: u32,
    pub total_held: u64,
    pub commitment_fee: u64,
    pub released_to_date: u64,
    pub refunded_to_date: u64,
    pub status: EscrowStatus,
    pub frozen_from: Option<EscrowStatus>,
    pub freeze_reason: Option<String>,
    pub milestones: Vec<Milestone>,
    pub entries: Vec<LedgerEntry>,
    pub funded_at: DateTime<Utc>,
}

/// Create the escrow account for a booking. A slot that is already funded stays untouched.
pub fn fund<'a>(
    slot: &'a mut Option<EscrowAccount>,
    booking_id: &BookingId,
    total_price: u64,
    tier: &TierPolicy,
    config_version: u32,
    now: DateTime<Utc>,
) -> Result<&'a mut EscrowAccount, EscrowError> {
    if slot.is_some() {
        return Err(EscrowError::AlreadyFunded);
    }
    if total_price == 0 {
        return Err(EscrowError::InvalidAmount);
    }

    let milestones = if tier.tier.uses_milestones() {
        milestones::plan(total_price, &tier.milestone_percents)
    } else {
        Vec::new()
    };

    Ok(slot.insert(EscrowAccount {
        booking_id: booking_id.clone(),
        tier: tier.tier,
        config_version,
        total_held: total_price,
        commitment_fee: percent_of(total_price, tier.commitment_fee_percent),
        released_to_date: 0,
        refunded_to_date: 0,
        status: EscrowStatus::Held,
        frozen_from: None,
        freeze_reason: None,
        milestones,
        entries: Vec::new(),
        funded_at: now,
    }))
}

impl EscrowAccount {
    pub fn remaining(&self) -> u64 {
        self.total_held
            .saturating_sub(self.released_to_date)
            .saturating_sub(self.refunded_to_date)
    }

    pub fn percent_released(&self) -> f64 {
        if self.total_held == 0 {
            return 0.0;
        }
        self.released_to_date as f64 * 100.0 / self.total_held as f64
    }

    pub fn is_frozen(&self) -> bool {
        self.status == EscrowStatus::Frozen
    }

    /// Pay the commitment fee to the provider once check-in passes. An earlier admin
    /// movement can leave less than the fee in escrow; only what remains is paid.
    pub fn release_commitment(
        &mut self,
        now: DateTime<Utc>,
    ) -> Result<Option<LedgerEntry>, EscrowError> {
        if self.status != EscrowStatus::Held {
            return Err(EscrowError::NotHeld {
                status: self.status,
            });
        }

        let amount = self.commitment_fee.min(self.remaining());
        let entry = if amount > 0 {
            Some(self.pay_provider(amount, MovementReason::CommitmentFee, now)?)
        } else {
            None
        };
        self.status = EscrowStatus::CommitmentReleased;
        Ok(entry)
    }

    /// Release up to the remaining balance to the provider. The account settles as
    /// `released` or `auto_released` once nothing remains.
    pub fn release_balance(
        &mut self,
        amount: u64,
        reason: MovementReason,
        authority: Authority,
        now: DateTime<Utc>,
    ) -> Result<Option<LedgerEntry>, EscrowError> {
        self.ensure_movable(authority)?;
        self.ensure_available(amount)?;

        let entry = if amount > 0 {
            Some(self.pay_provider(amount, reason, now)?)
        } else {
            None
        };

        if self.remaining() == 0 {
            self.settle(reason.settles_as());
        }
        Ok(entry)
    }

    /// Release one tier-4 milestone. Standard authority enforces phase order; the caller
    /// learns whether an override skipped an unreleased earlier phase.
    pub fn release_milestone(
        &mut self,
        milestone_id: &MilestoneId,
        authority: Authority,
        now: DateTime<Utc>,
    ) -> Result<MilestoneRelease, EscrowError> {
        if !self.tier.uses_milestones() {
            return Err(EscrowError::NoMilestones);
        }
        self.ensure_movable(authority)?;

        let position = self
            .milestones
            .iter()
            .position(|milestone| &milestone.id == milestone_id)
            .ok_or_else(|| EscrowError::UnknownMilestone(milestone_id.0.clone()))?;

        let phase = self.milestones[position].phase;
        if self.milestones[position].status == MilestoneStatus::Released {
            return Err(EscrowError::MilestoneAlreadyReleased(phase));
        }

        let blocking = milestones::blocking_phase(&self.milestones, phase);
        if let (Some(blocking), Authority::Standard) = (blocking, authority) {
            return Err(EscrowError::OutOfOrder {
                phase,
                blocking_phase: blocking,
            });
        }

        let amount = self.milestones[position].outstanding();
        self.ensure_available(amount)?;

        milestones::settle(&mut self.milestones[position]);
        self.released_to_date += amount;
        let entry = self.record(Payee::Provider, amount, MovementReason::MilestoneApproved, now);

        if self.remaining() == 0 {
            self.settle(EscrowStatus::Released);
        } else if !self.is_frozen() {
            self.status = EscrowStatus::MilestonePartial;
        }

        Ok(MilestoneRelease {
            phase,
            entry,
            bypassed_ordering: blocking.is_some(),
        })
    }

    /// Move into the observation window after work is marked complete.
    pub fn begin_observation(&mut self) -> Result<(), EscrowError> {
        match self.status {
            EscrowStatus::CommitmentReleased | EscrowStatus::MilestonePartial => {
                self.status = EscrowStatus::ObservationActive;
                Ok(())
            }
            status => Err(EscrowError::UnexpectedStatus {
                status,
                operation: "begin_observation",
            }),
        }
    }

    pub fn freeze(&mut self, reason: impl Into<String>) -> Result<(), EscrowError> {
        if self.status.is_terminal() {
            return Err(EscrowError::Terminal {
                status: self.status,
            });
        }
        if !self.is_frozen() {
            self.frozen_from = Some(self.status);
            self.status = EscrowStatus::Frozen;
        }
        self.freeze_reason = Some(reason.into());
        Ok(())
    }

    pub fn unfreeze(&mut self) -> Result<EscrowStatus, EscrowError> {
        if !self.is_frozen() {
            return Err(EscrowError::NotFrozen {
                status: self.status,
            });
        }
        let restored = self.frozen_from.take().unwrap_or(EscrowStatus::Held);
        self.status = restored;
        self.freeze_reason = None;
        Ok(restored)
    }

    /// Return funds to the client. The account settles as `refunded` once nothing remains.
    pub fn refund(
        &mut self,
        amount: u64,
        reason: MovementReason,
        authority: Authority,
        now: DateTime<Utc>,
    ) -> Result<Option<LedgerEntry>, EscrowError> {
        self.ensure_movable(authority)?;
        self.ensure_available(amount)?;

        let entry = (amount > 0).then(|| {
            self.refunded_to_date += amount;
            self.record(Payee::Client, amount, reason, now)
        });

        if self.remaining() == 0 {
            self.settle(EscrowStatus::Refunded);
        }
        Ok(entry)
    }

    /// Record the payment rail's acknowledgement. Returns false for a repeated ack.
    pub fn acknowledge(
        &mut self,
        reference: &str,
        at: DateTime<Utc>,
    ) -> Result<bool, EscrowError> {
        let entry = self
            .entries
            .iter_mut()
            .find(|entry| entry.reference == reference)
            .ok_or_else(|| EscrowError::UnknownReference(reference.to_string()))?;

        if entry.acknowledged_at.is_some() {
            return Ok(false);
        }
        entry.acknowledged_at = Some(at);
        Ok(true)
    }

    pub fn unacknowledged(&self) -> impl Iterator<Item = &LedgerEntry> {
        self.entries
            .iter()
            .filter(|entry| entry.acknowledged_at.is_none())
    }

    fn ensure_movable(&self, authority: Authority) -> Result<(), EscrowError> {
        if self.status.is_terminal() {
            return Err(EscrowError::Terminal {
                status: self.status,
            });
        }
        if self.is_frozen() && authority == Authority::Standard {
            return Err(EscrowError::Frozen);
        }
        Ok(())
    }

    fn ensure_available(&self, amount: u64) -> Result<(), EscrowError> {
        let remaining = self.remaining();
        if amount > remaining {
            return Err(EscrowError::InsufficientEscrow {
                requested: amount,
                remaining,
            });
        }
        Ok(())
    }

    fn pay_provider(
        &mut self,
        amount: u64,
        reason: MovementReason,
        now: DateTime<Utc>,
    ) -> Result<LedgerEntry, EscrowError> {
        self.ensure_available(amount)?;
        self.released_to_date += amount;
        milestones::credit_in_order(&mut self.milestones, amount);
        Ok(self.record(Payee::Provider, amount, reason, now))
    }

    fn record(
        &mut self,
        payee: Payee,
        amount: u64,
        reason: MovementReason,
        now: DateTime<Utc>,
    ) -> LedgerEntry {
        let entry = LedgerEntry {
            reference: format!("{}-{:03}", self.booking_id.0, self.entries.len() + 1),
            payee,
            amount,
            reason,
            recorded_at: now,
            acknowledged_at: None,
        };
        self.entries.push(entry.clone());
        entry
    }

    fn settle(&mut self, status: EscrowStatus) {
        self.status = status;
        self.frozen_from = None;
        self.freeze_reason = None;
    }
}

/// Result of a milestone release.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MilestoneRelease {
    pub phase: u32,
    pub entry: LedgerEntry,
    pub bypassed_ordering: bool,
}

/// Ledger invariant violations.
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum EscrowError {
    #[error("escrow already funded")]
    AlreadyFunded,
    #[error("escrow has not been funded")]
    NotFunded,
    #[error("escrow amount must be greater than zero")]
    InvalidAmount,
    #[error("commitment fee can only be released from held escrow (status {})", .status.label())]
    NotHeld { status: EscrowStatus },
    #[error("requested {requested} exceeds remaining escrow {remaining}")]
    InsufficientEscrow { requested: u64, remaining: u64 },
    #[error("milestone phase {phase} cannot be released before phase {blocking_phase}")]
    OutOfOrder { phase: u32, blocking_phase: u32 },
    #[error("escrow is frozen")]
    Frozen,
    #[error("escrow is not frozen (status {})", .status.label())]
    NotFrozen { status: EscrowStatus },
    #[error("escrow is settled (status {})", .status.label())]
    Terminal { status: EscrowStatus },
    #[error("{operation} is not valid while escrow is {}", .status.label())]
    UnexpectedStatus {
        status: EscrowStatus,
        operation: &'static str,
    },
    #[error("booking does not pay out in milestones")]
    NoMilestones,
    #[error("unknown milestone {0}")]
    UnknownMilestone(String),
    #[error("milestone phase {0} already released")]
    MilestoneAlreadyReleased(u32),
    #[error("unknown ledger reference {0}")]
    UnknownReference(String),
}
