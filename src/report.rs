use std::fmt::Write;

use chrono::{DateTime, Utc};

use crate::models::{GroupMember, GroupRecord};
use crate::recompute::RunSummary;

pub fn render_summary(summary: &RunSummary) -> String {
    let mut output = String::new();

    let _ = writeln!(
        output,
        "Recomputed {} groups: {} succeeded, {} failed.",
        summary.total_groups, summary.succeeded, summary.failed
    );
    for outcome in &summary.outcomes {
        let _ = writeln!(
            output,
            "- {} ({}): {} students from {} rolls",
            outcome.name, outcome.group_id, outcome.student_count, outcome.roll_count
        );
    }
    for failure in &summary.failures {
        let _ = writeln!(
            output,
            "- FAILED {} [{}]: {}",
            failure.group_id, failure.error_kind, failure.message
        );
    }

    output
}

fn describe_rule(group: &GroupRecord) -> String {
    format!(
        "{} {} incidents of {} in the last {} weeks",
        group.ltmt, group.incidents, group.roll_states, group.number_of_weeks
    )
}

pub fn build_report(generated_at: DateTime<Utc>, groups: &[(GroupRecord, Vec<GroupMember>)]) -> String {
    let mut output = String::new();

    let _ = writeln!(output, "# Behavior Groups Report");
    let _ = writeln!(output, "Generated at {}", generated_at.format("%Y-%m-%d %H:%M UTC"));

    if groups.is_empty() {
        let _ = writeln!(output);
        let _ = writeln!(output, "No groups defined.");
        return output;
    }

    for (group, members) in groups {
        let _ = writeln!(output);
        let _ = writeln!(output, "## {}", group.name);
        let _ = writeln!(output, "Rule: {}", describe_rule(group));
        match group.run_at {
            Some(run_at) => {
                let _ = writeln!(
                    output,
                    "Last run {} with {} students",
                    run_at.format("%Y-%m-%d %H:%M UTC"),
                    group.student_count
                );
            }
            None => {
                let _ = writeln!(output, "Not yet computed");
            }
        }

        let _ = writeln!(output);
        if members.is_empty() {
            let _ = writeln!(output, "No students in this group.");
            continue;
        }

        let mut ranked = members.clone();
        ranked.sort_by(|a, b| {
            b.incident_count
                .cmp(&a.incident_count)
                .then_with(|| a.full_name.cmp(&b.full_name))
        });
        for member in &ranked {
            let _ = writeln!(
                output,
                "- {}: {} incidents",
                member.full_name, member.incident_count
            );
        }
    }

    output
}
