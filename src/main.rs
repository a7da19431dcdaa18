use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use chrono::{DateTime, Utc};
use clap::{Args, Parser, Subcommand};
use sqlx::postgres::PgPoolOptions;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use uuid::Uuid;

mod config;
mod db;
mod error;
mod filter;
mod groups;
#[cfg(test)]
mod memory;
mod models;
mod recompute;
mod report;
mod store;
mod validation;

use config::Config;
use db::PgStore;
use error::Error;
use models::{NewRollState, NewStudent, RollPatch, RollState, StudentPatch};
use recompute::Recomputer;
use store::GroupStore;
use validation::{GroupInput, GroupPatch};

#[derive(Parser)]
#[command(name = "behavior-groups")]
#[command(about = "Rule-based student behavior groups computed from attendance rolls", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create or upgrade the database schema
    InitDb,
    /// Load realistic seed data
    Seed,
    /// Import student roll states from a CSV file (roll_id,student_id,state)
    Import {
        #[arg(long)]
        csv: PathBuf,
    },
    /// Recompute the membership of every group
    Run {
        /// Print the run summary as JSON
        #[arg(long)]
        json: bool,
    },
    /// Write a markdown report of every group and its members
    Report {
        #[arg(long, default_value = "groups.md")]
        out: PathBuf,
    },
    /// Manage group definitions
    #[command(subcommand)]
    Group(GroupCommand),
    /// Manage rolls and student roll states
    #[command(subcommand)]
    Roll(RollCommand),
    /// Manage students
    #[command(subcommand)]
    Student(StudentCommand),
}

#[derive(Subcommand)]
enum GroupCommand {
    List,
    Show { id: Uuid },
    Create(GroupFields),
    Update {
        id: Uuid,
        #[command(flatten)]
        fields: GroupPatchFields,
    },
    Delete { id: Uuid },
    /// List the students currently in a group
    Students { id: Uuid },
}

#[derive(Args)]
struct GroupFields {
    #[arg(long)]
    name: String,
    #[arg(long, allow_negative_numbers = true)]
    weeks: i32,
    /// Comma-separated states: late, absent, present, unmark
    #[arg(long)]
    states: String,
    #[arg(long, allow_negative_numbers = true)]
    incidents: i32,
    /// "<" or ">"
    #[arg(long)]
    ltmt: String,
}

#[derive(Args)]
struct GroupPatchFields {
    #[arg(long)]
    name: Option<String>,
    #[arg(long, allow_negative_numbers = true)]
    weeks: Option<i32>,
    #[arg(long)]
    states: Option<String>,
    #[arg(long, allow_negative_numbers = true)]
    incidents: Option<i32>,
    #[arg(long)]
    ltmt: Option<String>,
}

#[derive(Subcommand)]
enum RollCommand {
    List,
    Show { id: Uuid },
    Create {
        #[arg(long)]
        name: String,
        /// RFC 3339 timestamp; omit for a roll still in progress
        #[arg(long)]
        completed_at: Option<DateTime<Utc>>,
    },
    Update {
        id: Uuid,
        #[arg(long)]
        name: Option<String>,
        #[arg(long)]
        completed_at: Option<DateTime<Utc>>,
    },
    /// Mark a roll as completed now
    Complete { id: Uuid },
    Delete { id: Uuid },
    /// List the student roll states recorded in a roll
    States { id: Uuid },
    /// Record one student's state in a roll
    Mark {
        roll_id: Uuid,
        student_id: Uuid,
        state: RollState,
    },
    /// Change a recorded student roll state
    SetState { id: Uuid, state: RollState },
}

#[derive(Subcommand)]
enum StudentCommand {
    List,
    Create {
        #[arg(long)]
        first_name: String,
        #[arg(long)]
        last_name: String,
        #[arg(long)]
        photo_url: Option<String>,
    },
    Update {
        id: Uuid,
        #[arg(long)]
        first_name: Option<String>,
        #[arg(long)]
        last_name: Option<String>,
        #[arg(long)]
        photo_url: Option<String>,
    },
    Delete { id: Uuid },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "behavior_groups=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    let config = Config::from_env()?;

    let pool = PgPoolOptions::new()
        .max_connections(config.max_connections)
        .connect(&config.database_url)
        .await
        .context("failed to connect to Postgres")?;
    let store = Arc::new(PgStore::new(pool));

    match cli.command {
        Commands::InitDb => {
            db::init_db(store.pool()).await?;
            println!("Schema ready.");
        }
        Commands::Seed => {
            if db::seed(&store).await? {
                println!("Seed data inserted.");
            } else {
                println!("Seed data already present.");
            }
        }
        Commands::Import { csv } => {
            let inserted = db::import_csv(&store, &csv).await?;
            println!("Inserted {inserted} roll states from {}.", csv.display());
        }
        Commands::Run { json } => {
            let recomputer = Recomputer::new(Arc::clone(&store), config.recompute);
            let summary = recomputer.run().await?;

            if json {
                println!("{}", serde_json::to_string_pretty(&summary)?);
            } else {
                print!("{}", report::render_summary(&summary));
            }
            if !summary.is_success() {
                anyhow::bail!(
                    "{} of {} groups failed to recompute",
                    summary.failed,
                    summary.total_groups
                );
            }
        }
        Commands::Report { out } => {
            let mut sections = Vec::new();
            for group in store.list_groups().await? {
                let members = groups::group_students(store.as_ref(), group.id).await?;
                sections.push((group, members));
            }
            let report = report::build_report(Utc::now(), &sections);
            std::fs::write(&out, report)?;
            println!("Report written to {}.", out.display());
        }
        Commands::Group(command) => run_group_command(&store, command).await?,
        Commands::Roll(command) => run_roll_command(&store, command).await?,
        Commands::Student(command) => run_student_command(&store, command).await?,
    }

    Ok(())
}

async fn run_group_command(store: &PgStore, command: GroupCommand) -> anyhow::Result<()> {
    match command {
        GroupCommand::List => {
            let all = store.list_groups().await?;
            if all.is_empty() {
                println!("No groups defined.");
            }
            for group in all {
                println!(
                    "- {} {} ({} {} of {} in {} weeks) students {} last run {}",
                    group.id,
                    group.name,
                    group.ltmt,
                    group.incidents,
                    group.roll_states,
                    group.number_of_weeks,
                    group.student_count,
                    group
                        .run_at
                        .map(|at| at.to_rfc3339())
                        .unwrap_or_else(|| "never".to_string())
                );
            }
        }
        GroupCommand::Show { id } => {
            let group = groups::get_group(store, id).await?;
            println!("{}", serde_json::to_string_pretty(&group)?);
        }
        GroupCommand::Create(fields) => {
            let group = groups::create_group(
                store,
                GroupInput {
                    name: fields.name,
                    number_of_weeks: fields.weeks,
                    roll_states: fields.states,
                    incidents: fields.incidents,
                    ltmt: fields.ltmt,
                },
            )
            .await?;
            println!("Created group {} ({}).", group.name, group.id);
        }
        GroupCommand::Update { id, fields } => {
            let patch = GroupPatch {
                name: fields.name,
                number_of_weeks: fields.weeks,
                roll_states: fields.states,
                incidents: fields.incidents,
                ltmt: fields.ltmt,
            };
            let group = groups::update_group(store, id, patch).await?;
            println!("Updated group {} ({}).", group.name, group.id);
        }
        GroupCommand::Delete { id } => {
            groups::delete_group(store, id).await?;
            println!("Group {id} deleted.");
        }
        GroupCommand::Students { id } => {
            let members = groups::group_students(store, id).await?;
            if members.is_empty() {
                println!("No students in this group.");
            }
            for member in members {
                println!(
                    "- {} ({}) {} incidents",
                    member.full_name, member.student_id, member.incident_count
                );
            }
        }
    }
    Ok(())
}

async fn run_roll_command(store: &PgStore, command: RollCommand) -> anyhow::Result<()> {
    match command {
        RollCommand::List => {
            for roll in store.list_rolls().await? {
                println!(
                    "- {} {} completed {}",
                    roll.id,
                    roll.name,
                    roll.completed_at
                        .map(|at| at.to_rfc3339())
                        .unwrap_or_else(|| "in progress".to_string())
                );
            }
        }
        RollCommand::Show { id } => {
            let roll = store
                .get_roll(id)
                .await?
                .ok_or_else(|| Error::not_found("roll", id))?;
            println!("{}", serde_json::to_string_pretty(&roll)?);
        }
        RollCommand::Create { name, completed_at } => {
            let roll = store.create_roll(&name, completed_at).await?;
            println!("Created roll {} ({}).", roll.name, roll.id);
        }
        RollCommand::Update {
            id,
            name,
            completed_at,
        } => {
            let patch = RollPatch { name, completed_at };
            let roll = store
                .update_roll(id, &patch)
                .await?
                .ok_or_else(|| Error::not_found("roll", id))?;
            println!("Updated roll {} ({}).", roll.name, roll.id);
        }
        RollCommand::Complete { id } => {
            let patch = RollPatch {
                name: None,
                completed_at: Some(Utc::now()),
            };
            store
                .update_roll(id, &patch)
                .await?
                .ok_or_else(|| Error::not_found("roll", id))?;
            println!("Roll {id} completed.");
        }
        RollCommand::Delete { id } => {
            if !store.delete_roll(id).await? {
                return Err(Error::not_found("roll", id).into());
            }
            println!("Roll {id} deleted.");
        }
        RollCommand::States { id } => {
            for state in store.roll_states(id).await? {
                println!("- {} student {} {}", state.id, state.student_id, state.state);
            }
        }
        RollCommand::Mark {
            roll_id,
            student_id,
            state,
        } => {
            let inserted = store
                .add_roll_states(&[NewRollState {
                    roll_id,
                    student_id,
                    state,
                }])
                .await?;
            for state in inserted {
                println!("Recorded {} as {} ({}).", state.student_id, state.state, state.id);
            }
        }
        RollCommand::SetState { id, state } => {
            let updated = store
                .update_roll_state(id, state)
                .await?
                .ok_or_else(|| Error::not_found("student roll state", id))?;
            println!("Roll state {} is now {}.", updated.id, updated.state);
        }
    }
    Ok(())
}

async fn run_student_command(store: &PgStore, command: StudentCommand) -> anyhow::Result<()> {
    match command {
        StudentCommand::List => {
            for student in store.list_students().await? {
                println!("- {} {} {}", student.id, student.first_name, student.last_name);
            }
        }
        StudentCommand::Create {
            first_name,
            last_name,
            photo_url,
        } => {
            let student = store
                .create_student(&NewStudent {
                    first_name,
                    last_name,
                    photo_url,
                })
                .await?;
            println!(
                "Created student {} {} ({}).",
                student.first_name, student.last_name, student.id
            );
        }
        StudentCommand::Update {
            id,
            first_name,
            last_name,
            photo_url,
        } => {
            let patch = StudentPatch {
                first_name,
                last_name,
                photo_url,
            };
            let student = store
                .update_student(id, &patch)
                .await?
                .ok_or_else(|| Error::not_found("student", id))?;
            println!(
                "Updated student {} {} ({}).",
                student.first_name, student.last_name, student.id
            );
        }
        StudentCommand::Delete { id } => {
            if !store.delete_student(id).await? {
                return Err(Error::not_found("student", id).into());
            }
            println!("Student {id} deleted.");
        }
    }
    Ok(())
}
