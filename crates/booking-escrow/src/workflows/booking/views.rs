use chrono::{DateTime, Utc};
use serde::Serialize;

use super::domain::{BookingId, BookingStatus, StatusChange};
use super::repository::BookingRecord;
use crate::workflows::escrow::{EscrowAccount, EscrowStatus, MilestoneStatus};
use crate::workflows::policy::ServiceTier;
use crate::workflows::rectification::{RectificationCase, RectificationStatus};

#[derive(Debug, Clone, Serialize)]
pub struct MilestoneView {
    pub id: String,
    pub phase: u32,
    pub percent: u32,
    pub amount: u64,
    pub released_amount: u64,
    pub status: MilestoneStatus,
    pub status_label: &'static str,
}

#[derive(Debug, Clone, Serialize)]
pub struct EscrowView {
    pub status: EscrowStatus,
    pub status_label: &'static str,
    pub total_held: u64,
    pub commitment_fee: u64,
    pub released_to_date: u64,
    pub refunded_to_date: u64,
    pub remaining: u64,
    pub percent_released: f64,
    pub config_version: u32,
    pub unacknowledged_payments: usize,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub milestones: Vec<MilestoneView>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RectificationView {
    pub case_id: String,
    pub status: RectificationStatus,
    pub status_label: &'static str,
    pub category: &'static str,
    pub attempts: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sla_deadline: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sla_hours_remaining: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub escalation_reason: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resolution: Option<&'static str>,
}

/// Read model handed to booking screens and trackers.
#[derive(Debug, Clone, Serialize)]
pub struct BookingView {
    pub booking_id: BookingId,
    pub status: BookingStatus,
    pub status_label: &'static str,
    pub tier: ServiceTier,
    pub total_price: u64,
    pub config_version: u32,
    pub scheduled_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub observation_ends_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub observation_hours_remaining: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub escrow: Option<EscrowView>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rectification: Option<RectificationView>,
    pub history: Vec<StatusChange>,
}

impl BookingRecord {
    pub fn view(&self, now: DateTime<Utc>) -> BookingView {
        let booking = &self.booking;
        BookingView {
            booking_id: booking.id.clone(),
            status: booking.status,
            status_label: booking.status.label(),
            tier: booking.tier,
            total_price: booking.total_price,
            config_version: booking.config_version,
            scheduled_at: booking.scheduled_at,
            observation_ends_at: booking.observation_ends_at,
            observation_hours_remaining: booking
                .observation_ends_at
                .map(|ends| hours_until(ends, now)),
            escrow: self.escrow.as_ref().map(escrow_view),
            rectification: self.case.as_ref().map(|case| rectification_view(case, now)),
            history: booking.history.clone(),
        }
    }
}

fn escrow_view(account: &EscrowAccount) -> EscrowView {
    EscrowView {
        status: account.status,
        status_label: account.status.label(),
        total_held: account.total_held,
        commitment_fee: account.commitment_fee,
        released_to_date: account.released_to_date,
        refunded_to_date: account.refunded_to_date,
        remaining: account.remaining(),
        percent_released: account.percent_released(),
        config_version: account.config_version,
        unacknowledged_payments: account.unacknowledged().count(),
        milestones: account
            .milestones
            .iter()
            .map(|milestone| MilestoneView {
                id: milestone.id.0.clone(),
                phase: milestone.phase,
                percent: milestone.percent,
                amount: milestone.amount,
                released_amount: milestone.released_amount,
                status: milestone.status,
                status_label: milestone.status.label(),
            })
            .collect(),
    }
}

fn rectification_view(case: &RectificationCase, now: DateTime<Utc>) -> RectificationView {
    RectificationView {
        case_id: case.id.0.clone(),
        status: case.status,
        status_label: case.status.label(),
        category: case.category.label(),
        attempts: case.attempts,
        sla_deadline: case.sla_deadline(),
        sla_hours_remaining: case.sla_hours_remaining(now),
        escalation_reason: case
            .escalation
            .as_ref()
            .map(|escalation| escalation.reason.label()),
        resolution: case
            .resolution
            .as_ref()
            .map(|resolution| resolution.ruling.label()),
    }
}

fn hours_until(deadline: DateTime<Utc>, now: DateTime<Utc>) -> f64 {
    let seconds = (deadline - now).num_seconds().max(0);
    seconds as f64 / 3600.0
}
