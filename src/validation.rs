use std::fmt;

use serde::Serialize;

use crate::error::{Error, Result};
use crate::models::{Comparison, FilterRule, GroupDefinition, GroupRecord, RollStateSet};

/// A group definition as supplied by staff, before validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupInput {
    pub name: String,
    pub number_of_weeks: i32,
    pub roll_states: String,
    pub incidents: i32,
    pub ltmt: String,
}

/// A partial edit of a group's filter fields.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GroupPatch {
    pub name: Option<String>,
    pub number_of_weeks: Option<i32>,
    pub roll_states: Option<String>,
    pub incidents: Option<i32>,
    pub ltmt: Option<String>,
}

impl GroupPatch {
    /// Overlays the patch on a stored group.
    pub fn merge(self, existing: &GroupRecord) -> GroupInput {
        GroupInput {
            name: self.name.unwrap_or_else(|| existing.name.clone()),
            number_of_weeks: self.number_of_weeks.unwrap_or(existing.number_of_weeks),
            roll_states: self
                .roll_states
                .unwrap_or_else(|| existing.roll_states.clone()),
            incidents: self.incidents.unwrap_or(existing.incidents),
            ltmt: self.ltmt.unwrap_or_else(|| existing.ltmt.clone()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Violation {
    pub field: &'static str,
    pub message: String,
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

/// Checks every field and returns all violations found.
pub fn validate_group(input: &GroupInput) -> Vec<Violation> {
    let mut violations = Vec::new();
    let mut push = |field, message: String| violations.push(Violation { field, message });

    if input.name.trim().is_empty() {
        push("name", "name is required".into());
    }
    if input.number_of_weeks < 1 {
        push(
            "number_of_weeks",
            format!("must be at least 1, got {}", input.number_of_weeks),
        );
    }
    if let Err(msg) = RollStateSet::decode(&input.roll_states) {
        push("roll_states", msg);
    }
    if input.incidents < 0 {
        push(
            "incidents",
            format!("must not be negative, got {}", input.incidents),
        );
    }
    if let Err(msg) = input.ltmt.parse::<Comparison>() {
        push("ltmt", msg);
    }

    violations
}

impl GroupInput {
    /// Validates the input, producing the typed definition stored on write.
    pub fn into_definition(self) -> Result<GroupDefinition> {
        let violations = validate_group(&self);
        if !violations.is_empty() {
            let detail = violations
                .iter()
                .map(Violation::to_string)
                .collect::<Vec<_>>()
                .join("; ");
            return Err(Error::InvalidParameter(detail));
        }

        // Both decodes were checked above.
        let states = RollStateSet::decode(&self.roll_states).map_err(Error::InvalidParameter)?;
        let comparison = self.ltmt.parse().map_err(Error::InvalidParameter)?;

        Ok(GroupDefinition {
            name: self.name.trim().to_string(),
            rule: FilterRule {
                number_of_weeks: self.number_of_weeks,
                states,
                incidents: self.incidents,
                comparison,
            },
        })
    }
}
