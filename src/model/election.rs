use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use votecommit::{
    ballot::check_write_in, error::SelectionError, Choice, Selection,
};

/// Our election IDs are opaque strings.
pub type ElectionId = String;

/// States in the election lifecycle.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ElectionState {
    /// Under construction.
    Draft,
    /// Voters may obtain tokens but not yet vote.
    Registration,
    /// Voting in progress. Tokens may still be issued.
    Open,
    /// Voting finished.
    Closed,
    /// Completed and hidden by default.
    Archived,
}

/// Election metadata, as supplied by the relational store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Election {
    pub id: ElectionId,
    pub name: String,
    pub state: ElectionState,
    pub registration_opens: DateTime<Utc>,
    pub registration_closes: DateTime<Utc>,
    pub voting_opens: DateTime<Utc>,
    pub voting_closes: DateTime<Utc>,
    pub contests: Vec<Contest>,
}

/// A single race on the ballot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Contest {
    pub id: String,
    pub name: String,
    pub min_selections: u32,
    pub max_selections: u32,
    #[serde(default)]
    pub allow_write_in: bool,
    pub options: Vec<ContestOption>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContestOption {
    pub id: String,
    pub name: String,
}

impl Election {
    /// Whether blind tokens may be issued at `now`.
    pub fn is_issuing_tokens(&self, now: DateTime<Utc>) -> bool {
        matches!(
            self.state,
            ElectionState::Registration | ElectionState::Open
        ) && self.registration_opens <= now
            && now <= self.registration_closes
    }

    /// Whether ballots may be cast at `now`.
    pub fn is_accepting_votes(&self, now: DateTime<Utc>) -> bool {
        self.state == ElectionState::Open && self.voting_opens <= now && now <= self.voting_closes
    }

    /// Whether commitments may still be written to the ledger.
    /// Queued commitments from the voting window are still anchored after
    /// the window ends, as long as the election has not been closed.
    pub fn is_anchoring(&self) -> bool {
        self.state == ElectionState::Open
    }

    /// Check a ballot against the contest schema.
    pub fn validate_selections(&self, selections: &[Selection]) -> Result<(), SelectionError> {
        if selections.is_empty() {
            return Err(SelectionError::Empty);
        }
        let contests: HashMap<&str, &Contest> =
            self.contests.iter().map(|c| (c.id.as_str(), c)).collect();
        let mut counts: HashMap<&str, u32> = HashMap::new();
        let mut seen: HashSet<(&str, &str)> = HashSet::new();

        for selection in selections {
            let contest = contests
                .get(selection.contest_id.as_str())
                .ok_or_else(|| SelectionError::UnknownContest(selection.contest_id.clone()))?;
            match &selection.choice {
                Choice::Option(option) => {
                    if !contest.options.iter().any(|o| &o.id == option) {
                        return Err(SelectionError::UnknownOption {
                            contest: contest.id.clone(),
                            option: option.clone(),
                        });
                    }
                    if !seen.insert((contest.id.as_str(), option.as_str())) {
                        return Err(SelectionError::DuplicateOption {
                            contest: contest.id.clone(),
                            option: option.clone(),
                        });
                    }
                }
                Choice::WriteIn(name) => {
                    if !contest.allow_write_in {
                        return Err(SelectionError::WriteInNotAllowed(contest.id.clone()));
                    }
                    check_write_in(&contest.id, name)?;
                }
            }
            *counts.entry(contest.id.as_str()).or_default() += 1;
        }

        // Absent contests count as zero selections.
        for contest in &self.contests {
            let actual = counts.get(contest.id.as_str()).copied().unwrap_or(0);
            if actual < contest.min_selections || actual > contest.max_selections {
                return Err(SelectionError::Count {
                    contest: contest.id.clone(),
                    min: contest.min_selections,
                    max: contest.max_selections,
                    actual,
                });
            }
        }
        Ok(())
    }
}
