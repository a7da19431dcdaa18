use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::error::{Error, Result};

/// A student's recorded status in one roll.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RollState {
    Late,
    Absent,
    Present,
    Unmark,
}

impl RollState {
    pub const ALL: [RollState; 4] = [
        RollState::Late,
        RollState::Absent,
        RollState::Present,
        RollState::Unmark,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            RollState::Late => "late",
            RollState::Absent => "absent",
            RollState::Present => "present",
            RollState::Unmark => "unmark",
        }
    }
}

impl fmt::Display for RollState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RollState {
    type Err = String;

    fn from_str(value: &str) -> std::result::Result<Self, Self::Err> {
        RollState::ALL
            .into_iter()
            .find(|state| state.as_str() == value)
            .ok_or_else(|| format!("unrecognized roll state {value:?}"))
    }
}

/// The qualifying states of a group, stored as a comma-separated column.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct RollStateSet(BTreeSet<RollState>);

impl RollStateSet {
    /// Decodes `"late, absent"` style text. Tokens are trimmed; an empty
    /// string or any unknown token is rejected.
    pub fn decode(csv: &str) -> std::result::Result<Self, String> {
        if csv.trim().is_empty() {
            return Err("at least one roll state is required".into());
        }
        csv.split(',')
            .map(|token| token.trim().parse::<RollState>())
            .collect::<std::result::Result<BTreeSet<_>, _>>()
            .map(RollStateSet)
    }

    pub fn encode(&self) -> String {
        self.0
            .iter()
            .map(|state| state.as_str())
            .collect::<Vec<_>>()
            .join(",")
    }

    pub fn iter(&self) -> impl Iterator<Item = RollState> + '_ {
        self.0.iter().copied()
    }

    pub fn labels(&self) -> Vec<String> {
        self.iter().map(|state| state.as_str().to_string()).collect()
    }
}

/// The `ltmt` operator of a group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Comparison {
    #[serde(rename = "<")]
    LessThan,
    #[serde(rename = ">")]
    GreaterThan,
}

impl Comparison {
    pub fn as_str(self) -> &'static str {
        match self {
            Comparison::LessThan => "<",
            Comparison::GreaterThan => ">",
        }
    }

    /// Strict comparison: the threshold itself never matches.
    pub fn admits(self, count: i64, threshold: i64) -> bool {
        match self {
            Comparison::LessThan => count < threshold,
            Comparison::GreaterThan => count > threshold,
        }
    }
}

impl FromStr for Comparison {
    type Err = String;

    fn from_str(value: &str) -> std::result::Result<Self, Self::Err> {
        match value {
            "<" => Ok(Comparison::LessThan),
            ">" => Ok(Comparison::GreaterThan),
            other => Err(format!("ltmt must be either \"<\" or \">\", got {other:?}")),
        }
    }
}

/// The typed filter a group applies during recomputation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FilterRule {
    pub number_of_weeks: i32,
    pub states: RollStateSet,
    pub incidents: i32,
    pub comparison: Comparison,
}

/// A validated group definition, ready to be written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupDefinition {
    pub name: String,
    pub rule: FilterRule,
}

/// A group row as persisted. `roll_states` and `ltmt` stay in their stored
/// text form here and are decoded through [`GroupRecord::rule`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GroupRecord {
    pub id: Uuid,
    pub name: String,
    pub number_of_weeks: i32,
    pub roll_states: String,
    pub incidents: i32,
    pub ltmt: String,
    pub student_count: i32,
    pub run_at: Option<DateTime<Utc>>,
}

impl GroupRecord {
    pub fn rule(&self) -> Result<FilterRule> {
        let invalid = |msg: String| Error::Configuration(format!("group {}: {msg}", self.id));

        if self.number_of_weeks < 1 {
            return Err(invalid(format!(
                "number_of_weeks must be positive, got {}",
                self.number_of_weeks
            )));
        }
        if self.incidents < 0 {
            return Err(invalid(format!(
                "incidents must not be negative, got {}",
                self.incidents
            )));
        }

        Ok(FilterRule {
            number_of_weeks: self.number_of_weeks,
            states: RollStateSet::decode(&self.roll_states).map_err(invalid)?,
            incidents: self.incidents,
            comparison: self.ltmt.parse().map_err(invalid)?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Roll {
    pub id: Uuid,
    pub name: String,
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StudentRollState {
    pub id: Uuid,
    pub roll_id: Uuid,
    pub student_id: Uuid,
    pub state: RollState,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Student {
    pub id: Uuid,
    pub first_name: String,
    pub last_name: String,
    pub photo_url: Option<String>,
}

/// A student listed as a member of a group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GroupMember {
    pub student_id: Uuid,
    pub first_name: String,
    pub last_name: String,
    pub full_name: String,
    pub incident_count: i32,
}

/// One membership row produced by recomputation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Membership {
    pub student_id: Uuid,
    pub incident_count: i64,
}

#[derive(Debug, Clone, Default)]
pub struct RollPatch {
    pub name: Option<String>,
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct NewRollState {
    pub roll_id: Uuid,
    pub student_id: Uuid,
    pub state: RollState,
}

#[derive(Debug, Clone)]
pub struct NewStudent {
    pub first_name: String,
    pub last_name: String,
    pub photo_url: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct StudentPatch {
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub photo_url: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(roll_states: &str, ltmt: &str, weeks: i32) -> GroupRecord {
        GroupRecord {
            id: Uuid::new_v4(),
            name: "Frequently late".to_string(),
            number_of_weeks: weeks,
            roll_states: roll_states.to_string(),
            incidents: 3,
            ltmt: ltmt.to_string(),
            student_count: 0,
            run_at: None,
        }
    }

    #[test]
    fn decodes_trimmed_states_and_encodes_canonically() {
        let set = RollStateSet::decode(" absent ,late,late").unwrap();
        let states: Vec<_> = set.iter().collect();
        assert_eq!(states, vec![RollState::Late, RollState::Absent]);
        assert_eq!(set.encode(), "late,absent");
        assert_eq!(set.labels(), vec!["late", "absent"]);
    }

    #[test]
    fn rejects_unknown_or_empty_states() {
        assert!(RollStateSet::decode("late,tardy").is_err());
        assert!(RollStateSet::decode("  ").is_err());
        assert!(RollStateSet::decode("late,").is_err());
    }

    #[test]
    fn comparison_is_strict() {
        assert!(Comparison::GreaterThan.admits(4, 3));
        assert!(!Comparison::GreaterThan.admits(3, 3));
        assert!(Comparison::LessThan.admits(2, 3));
        assert!(!Comparison::LessThan.admits(3, 3));
        assert!("<=".parse::<Comparison>().is_err());
    }

    #[test]
    fn comparison_must_be_exact() {
        assert_eq!(">".parse::<Comparison>(), Ok(Comparison::GreaterThan));
        for padded in [" > ", "< ", "\t<"] {
            assert!(padded.parse::<Comparison>().is_err(), "{padded:?}");
        }
    }

    #[test]
    fn record_rule_reports_configuration_errors() {
        let rule = record("late,absent", ">", 4).rule().unwrap();
        assert_eq!(rule.comparison, Comparison::GreaterThan);
        assert_eq!(rule.number_of_weeks, 4);

        for bad in [record("late,sick", ">", 4), record("late", ">=", 4), record("late", "<", 0)] {
            let err = bad.rule().unwrap_err();
            assert!(matches!(err, Error::Configuration(_)), "{err}");
        }
    }
}
