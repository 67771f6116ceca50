//! Campaign records.
//!
//! A campaign is the top-level unit of work: one goal, an ordered list of
//! objectives, and an immutable policy snapshot taken at creation time.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::model::short_id;
use crate::policy::PolicySnapshot;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CampaignStatus {
    Active,
    Done,
    Failed,
    Aborted,
}

impl CampaignStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, CampaignStatus::Active)
    }
}

impl std::fmt::Display for CampaignStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            CampaignStatus::Active => "active",
            CampaignStatus::Done => "done",
            CampaignStatus::Failed => "failed",
            CampaignStatus::Aborted => "aborted",
        };
        write!(f, "{s}")
    }
}

/// Mid-campaign human guidance, queued against the campaign and consumed
/// by the coordinator at the next safe suspension point between stages.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GuidanceNote {
    pub at: DateTime<Utc>,
    pub text: String,
    #[serde(default)]
    pub consumed: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Campaign {
    pub id: String,
    /// The originating goal text, free-form.
    pub goal: String,
    pub status: CampaignStatus,
    /// Bypass mode: skip Breakdown and Design, run a single objective.
    #[serde(default)]
    pub direct: bool,
    /// Objective ids in execution order. Filled by the Breakdown stage.
    #[serde(default)]
    pub objective_ids: Vec<String>,
    /// Immutable copy of the stage/retry/timeout configuration taken at
    /// creation. Later configuration changes affect only new campaigns.
    pub policy: PolicySnapshot,
    /// Raw worker output per campaign-level stage ("breakdown", "design").
    #[serde(default)]
    pub stage_outputs: BTreeMap<String, String>,
    #[serde(default)]
    pub guidance: Vec<GuidanceNote>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Campaign {
    pub fn new(goal: &str, policy: PolicySnapshot, direct: bool) -> Self {
        let now = Utc::now();
        Self {
            id: short_id("cmp"),
            goal: goal.to_string(),
            status: CampaignStatus::Active,
            direct,
            objective_ids: Vec::new(),
            policy,
            stage_outputs: BTreeMap::new(),
            guidance: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn push_guidance(&mut self, text: &str) {
        self.guidance.push(GuidanceNote {
            at: Utc::now(),
            text: text.to_string(),
            consumed: false,
        });
        self.updated_at = Utc::now();
    }

    /// Mark all unconsumed guidance notes consumed and return their texts.
    pub fn drain_guidance(&mut self) -> Vec<String> {
        let mut drained = Vec::new();
        for note in self.guidance.iter_mut().filter(|n| !n.consumed) {
            note.consumed = true;
            drained.push(note.text.clone());
        }
        if !drained.is_empty() {
            self.updated_at = Utc::now();
        }
        drained
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::PolicySnapshot;

    #[test]
    fn new_campaign_is_active_with_empty_objectives() {
        let campaign = Campaign::new("ship the auth service", PolicySnapshot::default(), false);
        assert!(campaign.id.starts_with("cmp_"));
        assert_eq!(campaign.status, CampaignStatus::Active);
        assert!(campaign.objective_ids.is_empty());
        assert!(!campaign.direct);
    }

    #[test]
    fn guidance_is_drained_once() {
        let mut campaign = Campaign::new("goal", PolicySnapshot::default(), false);
        campaign.push_guidance("prefer sqlx over diesel");
        campaign.push_guidance("keep endpoints versioned");

        let first = campaign.drain_guidance();
        assert_eq!(first.len(), 2);
        assert!(campaign.drain_guidance().is_empty());
    }

    #[test]
    fn only_active_is_non_terminal() {
        assert!(!CampaignStatus::Active.is_terminal());
        assert!(CampaignStatus::Done.is_terminal());
        assert!(CampaignStatus::Failed.is_terminal());
        assert!(CampaignStatus::Aborted.is_terminal());
    }
}
