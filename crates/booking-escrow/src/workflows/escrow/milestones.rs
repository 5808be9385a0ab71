use serde::{Deserialize, Serialize};

use crate::workflows::policy::percent_of;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MilestoneId(pub String);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MilestoneStatus {
    Pending,
    InProgress,
    Released,
}

impl MilestoneStatus {
    pub const fn label(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Released => "released",
        }
    }
}

/// Fixed-percentage payment phase of a tier-4 project.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Milestone {
    pub id: MilestoneId,
    pub phase: u32,
    pub percent: u32,
    pub amount: u64,
    pub released_amount: u64,
    pub status: MilestoneStatus,
}

impl Milestone {
    pub fn outstanding(&self) -> u64 {
        self.amount - self.released_amount
    }

    fn credit(&mut self, amount: u64) -> u64 {
        let applied = amount.min(self.outstanding());
        self.released_amount += applied;
        self.status = if self.outstanding() == 0 {
            MilestoneStatus::Released
        } else if self.released_amount > 0 {
            MilestoneStatus::InProgress
        } else {
            self.status
        };
        applied
    }
}

/// Split `total` across the configured percentages. The last phase absorbs rounding so
/// the amounts always add up to `total`.
pub(crate) fn plan(total: u64, percents: &[u32]) -> Vec<Milestone> {
    let mut allocated = 0u64;
    let last = percents.len().saturating_sub(1);

    percents
        .iter()
        .enumerate()
        .map(|(index, percent)| {
            let amount = if index == last {
                total - allocated
            } else {
                percent_of(total, *percent).min(total - allocated)
            };
            allocated += amount;
            let phase = index as u32 + 1;
            Milestone {
                id: MilestoneId(format!("ms-{phase}")),
                phase,
                percent: *percent,
                amount,
                released_amount: 0,
                status: MilestoneStatus::Pending,
            }
        })
        .collect()
}

/// Apply a provider payout to milestones in phase order.
pub(crate) fn credit_in_order(milestones: &mut [Milestone], mut amount: u64) {
    for milestone in milestones.iter_mut() {
        if amount == 0 {
            break;
        }
        amount -= milestone.credit(amount);
    }
}

/// First phase before `phase` that has not been released yet.
pub(crate) fn blocking_phase(milestones: &[Milestone], phase: u32) -> Option<u32> {
    milestones
        .iter()
        .filter(|milestone| milestone.phase < phase)
        .find(|milestone| milestone.status != MilestoneStatus::Released)
        .map(|milestone| milestone.phase)
}

pub(crate) fn settle(milestone: &mut Milestone) -> u64 {
    let outstanding = milestone.outstanding();
    milestone.credit(outstanding)
}

/// True when every released phase is preceded only by released phases.
pub fn released_in_order(milestones: &[Milestone]) -> bool {
    milestones
        .iter()
        .skip_while(|milestone| milestone.status == MilestoneStatus::Released)
        .all(|milestone| milestone.status != MilestoneStatus::Released)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plan_absorbs_rounding_into_last_phase() {
        let milestones = plan(100_001, &[30, 40, 30]);
        let amounts: Vec<u64> = milestones.iter().map(|m| m.amount).collect();
        assert_eq!(amounts, vec![30_000, 40_000, 30_001]);
        assert_eq!(amounts.iter().sum::<u64>(), 100_001);
    }

    #[test]
    fn plan_sums_to_total_for_awkward_prices() {
        for total in [1u64, 7, 99, 333, 1_000_003] {
            let milestones = plan(total, &[33, 33, 34]);
            assert_eq!(milestones.iter().map(|m| m.amount).sum::<u64>(), total);
        }
    }

    #[test]
    fn credit_fills_phases_in_order() {
        let mut milestones = plan(1_000, &[30, 40, 30]);
        credit_in_order(&mut milestones, 450);
        assert_eq!(milestones[0].status, MilestoneStatus::Released);
        assert_eq!(milestones[1].status, MilestoneStatus::InProgress);
        assert_eq!(milestones[1].released_amount, 150);
        assert_eq!(milestones[2].status, MilestoneStatus::Pending);
        assert!(released_in_order(&milestones));
    }

    #[test]
    fn blocking_phase_reports_first_unreleased_predecessor() {
        let mut milestones = plan(1_000, &[30, 40, 30]);
        assert_eq!(blocking_phase(&milestones, 3), Some(1));
        settle(&mut milestones[0]);
        assert_eq!(blocking_phase(&milestones, 3), Some(2));
        assert_eq!(blocking_phase(&milestones, 2), None);
    }
}
