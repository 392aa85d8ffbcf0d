//! Group → team resolution.
//!
//! The table is ordered, but resolution follows the caller's group order:
//! the first group (as the identity provider returned them) that has an
//! entry wins. Groups without an entry are ignored; a caller with no mapped
//! group lands in the catch-all team.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::Error;
use crate::types::TeamName;

/// Team, secret-store role, and policy set assigned to a principal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[non_exhaustive]
pub struct TeamAssignment {
    pub team: TeamName,
    pub role: String,
    pub policies: Vec<String>,
}

impl TeamAssignment {
    #[must_use]
    pub fn new(team: impl Into<String>, role: impl Into<String>, policies: &[&str]) -> Self {
        Self {
            team: TeamName(team.into()),
            role: role.into(),
            policies: policies.iter().map(|p| (*p).to_owned()).collect(),
        }
    }
}

/// One row of the table: an identity-provider group and what it maps to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[non_exhaustive]
pub struct TeamMapping {
    pub group: String,
    #[serde(flatten)]
    pub assignment: TeamAssignment,
}

/// Ordered group → team table with a catch-all.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TeamTable {
    teams: Vec<TeamMapping>,
    fallback: TeamAssignment,
}

impl Default for TeamTable {
    fn default() -> Self {
        Self::builtin()
    }
}

impl TeamTable {
    /// The table the broker ships with.
    #[must_use]
    pub fn builtin() -> Self {
        let row = |group: &str, team: &str, policies: &[&str]| TeamMapping {
            group: group.to_owned(),
            assignment: TeamAssignment::new(team, team, policies),
        };

        Self {
            teams: vec![
                row(
                    "mobile-developers",
                    "mobile-team",
                    &["bazel-base", "bazel-mobile-team"],
                ),
                row(
                    "backend-developers",
                    "backend-team",
                    &["bazel-base", "bazel-backend-team"],
                ),
                row(
                    "frontend-developers",
                    "frontend-team",
                    &["bazel-base", "bazel-frontend-team"],
                ),
                row(
                    "devops-team",
                    "devops-team",
                    &["bazel-base", "bazel-backend-team", "bazel-frontend-team"],
                ),
            ],
            fallback: TeamAssignment::new("base-team", "base-team", &["bazel-base"]),
        }
    }

    #[must_use]
    pub fn new(teams: Vec<TeamMapping>, fallback: TeamAssignment) -> Self {
        Self { teams, fallback }
    }

    /// Parse a table from `{"teams": [...], "fallback": {...}}`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ConfigurationMissing`] if the document does not parse
    /// or the catch-all has no policies.
    pub fn from_json(json: &str) -> Result<Self, Error> {
        let table: Self = serde_json::from_str(json)
            .map_err(|e| Error::ConfigurationMissing(format!("team table: {e}")))?;
        if table.fallback.policies.is_empty() {
            return Err(Error::ConfigurationMissing(
                "team table: fallback must carry at least one policy".into(),
            ));
        }
        Ok(table)
    }

    /// Read a table from a JSON file in the [`TeamTable::from_json`] format.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ConfigurationMissing`] if the file cannot be read or
    /// the table is invalid.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, Error> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path)
            .map_err(|e| Error::ConfigurationMissing(format!("{}: {e}", path.display())))?;
        Self::from_json(&json)
    }

    #[must_use]
    pub fn fallback(&self) -> &TeamAssignment {
        &self.fallback
    }

    fn lookup_group(&self, group: &str) -> Option<&TeamAssignment> {
        self.teams
            .iter()
            .find(|m| m.group == group)
            .map(|m| &m.assignment)
    }

    fn lookup_team(&self, team: &TeamName) -> Option<&TeamAssignment> {
        if self.fallback.team == *team {
            return Some(&self.fallback);
        }
        self.teams
            .iter()
            .map(|m| &m.assignment)
            .find(|a| a.team == *team)
    }

    /// Every team the groups map to, in group order, without duplicates.
    /// `[catch-all]` when nothing matches.
    #[must_use]
    pub fn resolve_teams(&self, groups: &[String]) -> Vec<TeamName> {
        let mut teams: Vec<TeamName> = Vec::new();
        for assignment in groups.iter().filter_map(|g| self.lookup_group(g)) {
            if !teams.contains(&assignment.team) {
                teams.push(assignment.team.clone());
            }
        }
        if teams.is_empty() {
            teams.push(self.fallback.team.clone());
        }
        teams
    }

    /// First-match assignment: the entry for the first group that has one.
    #[must_use]
    pub fn resolve_primary(&self, groups: &[String]) -> &TeamAssignment {
        groups
            .iter()
            .find_map(|g| self.lookup_group(g))
            .unwrap_or(&self.fallback)
    }

    /// Role for a caller. An explicit team (already chosen) decides directly;
    /// otherwise first-match over `groups`.
    #[must_use]
    pub fn resolve_role(&self, groups: &[String], explicit: Option<&TeamName>) -> String {
        match explicit {
            Some(team) => self.role_for(team),
            None => self.resolve_primary(groups).role.clone(),
        }
    }

    /// The table's role for `team`, or the team name when it has no entry.
    #[must_use]
    pub fn role_for(&self, team: &TeamName) -> String {
        self.lookup_team(team)
            .map_or_else(|| team.to_string(), |a| a.role.clone())
    }

    /// Policy set for `team`; unmapped teams get the catch-all's set.
    #[must_use]
    pub fn policies_for(&self, team: &TeamName) -> Vec<String> {
        self.lookup_team(team)
            .unwrap_or(&self.fallback)
            .policies
            .clone()
    }
}
