use std::collections::HashMap;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use sqlx::pool::PoolConnection;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Postgres, Row};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::filter::Window;
use crate::models::{
    GroupDefinition, GroupMember, GroupRecord, Membership, NewRollState, NewStudent, Roll,
    RollPatch, RollState, RollStateSet, Student, StudentPatch, StudentRollState,
};
use crate::store::{GroupStore, MembershipStore, RollStateStore, RollStore};
use crate::validation::GroupInput;

const GROUP_COLUMNS: &str =
    "id, name, number_of_weeks, roll_states, incidents, ltmt, student_count, run_at";

/// Advisory lock key serializing membership rebuilds across processes.
const REBUILD_LOCK_KEY: i64 = 0x6265_6876_6772_7073;

pub async fn init_db(pool: &PgPool) -> Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

/// Postgres-backed implementation of every store seam.
pub struct PgStore {
    pool: PgPool,
    rebuild_conn: Mutex<Option<PoolConnection<Postgres>>>,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            rebuild_conn: Mutex::new(None),
        }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn list_rolls(&self) -> Result<Vec<Roll>> {
        let rows = sqlx::query(
            "SELECT id, name, completed_at FROM behavior_groups.rolls \
             ORDER BY completed_at DESC NULLS FIRST, name",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(roll_from_row).collect()
    }

    pub async fn get_roll(&self, id: Uuid) -> Result<Option<Roll>> {
        let row = sqlx::query("SELECT id, name, completed_at FROM behavior_groups.rolls WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(roll_from_row).transpose()
    }

    pub async fn create_roll(
        &self,
        name: &str,
        completed_at: Option<DateTime<Utc>>,
    ) -> Result<Roll> {
        let row = sqlx::query(
            r#"
            INSERT INTO behavior_groups.rolls (id, name, completed_at)
            VALUES ($1, $2, $3)
            RETURNING id, name, completed_at
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(name)
        .bind(completed_at)
        .fetch_one(&self.pool)
        .await?;
        roll_from_row(&row)
    }

    pub async fn update_roll(&self, id: Uuid, patch: &RollPatch) -> Result<Option<Roll>> {
        let row = sqlx::query(
            r#"
            UPDATE behavior_groups.rolls
            SET name = COALESCE($2, name), completed_at = COALESCE($3, completed_at)
            WHERE id = $1
            RETURNING id, name, completed_at
            "#,
        )
        .bind(id)
        .bind(&patch.name)
        .bind(patch.completed_at)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(roll_from_row).transpose()
    }

    pub async fn delete_roll(&self, id: Uuid) -> Result<bool> {
        let result = sqlx::query("DELETE FROM behavior_groups.rolls WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn roll_states(&self, roll_id: Uuid) -> Result<Vec<StudentRollState>> {
        let rows = sqlx::query(
            "SELECT id, roll_id, student_id, state FROM behavior_groups.student_roll_states \
             WHERE roll_id = $1",
        )
        .bind(roll_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(roll_state_from_row).collect()
    }

    /// Inserts all states in one transaction.
    pub async fn add_roll_states(&self, states: &[NewRollState]) -> Result<Vec<StudentRollState>> {
        let mut tx = self.pool.begin().await?;
        let mut inserted = Vec::with_capacity(states.len());

        for state in states {
            let row = sqlx::query(
                r#"
                INSERT INTO behavior_groups.student_roll_states (id, roll_id, student_id, state)
                VALUES ($1, $2, $3, $4)
                RETURNING id, roll_id, student_id, state
                "#,
            )
            .bind(Uuid::new_v4())
            .bind(state.roll_id)
            .bind(state.student_id)
            .bind(state.state.as_str())
            .fetch_one(&mut *tx)
            .await?;
            inserted.push(roll_state_from_row(&row)?);
        }

        tx.commit().await?;
        Ok(inserted)
    }

    pub async fn update_roll_state(
        &self,
        id: Uuid,
        state: RollState,
    ) -> Result<Option<StudentRollState>> {
        let row = sqlx::query(
            r#"
            UPDATE behavior_groups.student_roll_states SET state = $2
            WHERE id = $1
            RETURNING id, roll_id, student_id, state
            "#,
        )
        .bind(id)
        .bind(state.as_str())
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(roll_state_from_row).transpose()
    }

    pub async fn list_students(&self) -> Result<Vec<Student>> {
        let rows = sqlx::query(
            "SELECT id, first_name, last_name, photo_url FROM behavior_groups.students \
             ORDER BY last_name, first_name",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(student_from_row).collect()
    }

    pub async fn create_student(&self, input: &NewStudent) -> Result<Student> {
        let row = sqlx::query(
            r#"
            INSERT INTO behavior_groups.students (id, first_name, last_name, photo_url)
            VALUES ($1, $2, $3, $4)
            RETURNING id, first_name, last_name, photo_url
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(&input.first_name)
        .bind(&input.last_name)
        .bind(&input.photo_url)
        .fetch_one(&self.pool)
        .await?;
        student_from_row(&row)
    }

    pub async fn update_student(&self, id: Uuid, patch: &StudentPatch) -> Result<Option<Student>> {
        let row = sqlx::query(
            r#"
            UPDATE behavior_groups.students
            SET first_name = COALESCE($2, first_name),
                last_name = COALESCE($3, last_name),
                photo_url = COALESCE($4, photo_url)
            WHERE id = $1
            RETURNING id, first_name, last_name, photo_url
            "#,
        )
        .bind(id)
        .bind(&patch.first_name)
        .bind(&patch.last_name)
        .bind(&patch.photo_url)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(student_from_row).transpose()
    }

    pub async fn delete_student(&self, id: Uuid) -> Result<bool> {
        let result = sqlx::query("DELETE FROM behavior_groups.students WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}

#[async_trait]
impl GroupStore for PgStore {
    async fn list_groups(&self) -> Result<Vec<GroupRecord>> {
        let query = format!("SELECT {GROUP_COLUMNS} FROM behavior_groups.groups ORDER BY name");
        let rows = sqlx::query(&query).fetch_all(&self.pool).await?;
        rows.iter().map(group_from_row).collect()
    }

    async fn get_group(&self, id: Uuid) -> Result<Option<GroupRecord>> {
        let query = format!("SELECT {GROUP_COLUMNS} FROM behavior_groups.groups WHERE id = $1");
        let row = sqlx::query(&query)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(group_from_row).transpose()
    }

    async fn create_group(&self, definition: &GroupDefinition) -> Result<GroupRecord> {
        let query = format!(
            "INSERT INTO behavior_groups.groups \
             (id, name, number_of_weeks, roll_states, incidents, ltmt, student_count) \
             VALUES ($1, $2, $3, $4, $5, $6, 0) \
             RETURNING {GROUP_COLUMNS}"
        );
        let row = sqlx::query(&query)
            .bind(Uuid::new_v4())
            .bind(&definition.name)
            .bind(definition.rule.number_of_weeks)
            .bind(definition.rule.states.encode())
            .bind(definition.rule.incidents)
            .bind(definition.rule.comparison.as_str())
            .fetch_one(&self.pool)
            .await?;
        group_from_row(&row)
    }

    async fn update_group(
        &self,
        id: Uuid,
        definition: &GroupDefinition,
    ) -> Result<Option<GroupRecord>> {
        let query = format!(
            "UPDATE behavior_groups.groups SET \
                name = $2, number_of_weeks = $3, roll_states = $4, incidents = $5, ltmt = $6 \
             WHERE id = $1 \
             RETURNING {GROUP_COLUMNS}"
        );
        let row = sqlx::query(&query)
            .bind(id)
            .bind(&definition.name)
            .bind(definition.rule.number_of_weeks)
            .bind(definition.rule.states.encode())
            .bind(definition.rule.incidents)
            .bind(definition.rule.comparison.as_str())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(group_from_row).transpose()
    }

    async fn delete_group(&self, id: Uuid) -> Result<bool> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM behavior_groups.group_students WHERE group_id = $1")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        let result = sqlx::query("DELETE FROM behavior_groups.groups WHERE id = $1")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(result.rows_affected() > 0)
    }
}

#[async_trait]
impl RollStore for PgStore {
    async fn find_completed_between(&self, window: Window) -> Result<Vec<Uuid>> {
        let rows = sqlx::query(
            r#"
            SELECT id FROM behavior_groups.rolls
            WHERE completed_at IS NOT NULL
              AND completed_at > $1
              AND completed_at <= $2
            ORDER BY completed_at
            "#,
        )
        .bind(window.start)
        .bind(window.end)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| row.try_get("id").map_err(Error::from))
            .collect()
    }
}

#[async_trait]
impl RollStateStore for PgStore {
    async fn aggregate_by_student(
        &self,
        roll_ids: &[Uuid],
        states: &RollStateSet,
    ) -> Result<HashMap<Uuid, i64>> {
        if roll_ids.is_empty() {
            return Ok(HashMap::new());
        }

        let rows = sqlx::query(
            r#"
            SELECT student_id, COUNT(*) FILTER (WHERE state = ANY($2)) AS incident_count
            FROM behavior_groups.student_roll_states
            WHERE roll_id = ANY($1)
            GROUP BY student_id
            "#,
        )
        .bind(roll_ids)
        .bind(states.labels())
        .fetch_all(&self.pool)
        .await?;

        let mut counts = HashMap::with_capacity(rows.len());
        for row in rows {
            counts.insert(row.try_get("student_id")?, row.try_get("incident_count")?);
        }
        Ok(counts)
    }
}

#[async_trait]
impl MembershipStore for PgStore {
    async fn lock_rebuild(&self) -> Result<()> {
        let mut conn = self.pool.acquire().await?;
        sqlx::query("SELECT pg_advisory_lock($1)")
            .bind(REBUILD_LOCK_KEY)
            .execute(&mut *conn)
            .await?;
        *self.rebuild_conn.lock().await = Some(conn);
        Ok(())
    }

    async fn unlock_rebuild(&self) -> Result<()> {
        let Some(mut conn) = self.rebuild_conn.lock().await.take() else {
            return Ok(());
        };
        sqlx::query("SELECT pg_advisory_unlock($1)")
            .bind(REBUILD_LOCK_KEY)
            .execute(&mut *conn)
            .await?;
        Ok(())
    }

    async fn clear_all(&self) -> Result<u64> {
        let result = sqlx::query("DELETE FROM behavior_groups.group_students")
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn materialize(
        &self,
        group_id: Uuid,
        members: &[Membership],
        run_at: DateTime<Utc>,
    ) -> Result<()> {
        let ids: Vec<Uuid> = members.iter().map(|_| Uuid::new_v4()).collect();
        let student_ids: Vec<Uuid> = members.iter().map(|m| m.student_id).collect();
        let counts = members
            .iter()
            .map(|m| narrow(m.incident_count, "incident_count"))
            .collect::<Result<Vec<i32>>>()?;
        let student_count = narrow(members.len() as i64, "student_count")?;

        let mut tx = self.pool.begin().await?;
        let updated = sqlx::query(
            "UPDATE behavior_groups.groups SET student_count = $2, run_at = $3 WHERE id = $1",
        )
        .bind(group_id)
        .bind(student_count)
        .bind(run_at)
        .execute(&mut *tx)
        .await?;

        if updated.rows_affected() == 0 {
            return Err(Error::not_found("group", group_id));
        }

        sqlx::query(
            r#"
            INSERT INTO behavior_groups.group_students (id, group_id, student_id, incident_count)
            SELECT m.id, $1, m.student_id, m.incident_count
            FROM UNNEST($2::uuid[], $3::uuid[], $4::int4[]) AS m(id, student_id, incident_count)
            "#,
        )
        .bind(group_id)
        .bind(&ids)
        .bind(&student_ids)
        .bind(&counts)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn list_by_group(&self, group_id: Uuid) -> Result<Vec<GroupMember>> {
        let rows = sqlx::query(
            r#"
            SELECT s.id AS student_id, s.first_name, s.last_name, gs.incident_count
            FROM behavior_groups.group_students gs
            JOIN behavior_groups.students s ON s.id = gs.student_id
            WHERE gs.group_id = $1
            ORDER BY s.last_name, s.first_name
            "#,
        )
        .bind(group_id)
        .fetch_all(&self.pool)
        .await?;

        let mut members = Vec::with_capacity(rows.len());
        for row in rows {
            let first_name: String = row.try_get("first_name")?;
            let last_name: String = row.try_get("last_name")?;
            members.push(GroupMember {
                student_id: row.try_get("student_id")?,
                full_name: format!("{first_name} {last_name}"),
                first_name,
                last_name,
                incident_count: row.try_get("incident_count")?,
            });
        }
        Ok(members)
    }
}

fn narrow(value: i64, field: &str) -> Result<i32> {
    i32::try_from(value)
        .map_err(|_| Error::InvalidParameter(format!("{field} {value} exceeds the column range")))
}

fn group_from_row(row: &PgRow) -> Result<GroupRecord> {
    Ok(GroupRecord {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        number_of_weeks: row.try_get("number_of_weeks")?,
        roll_states: row.try_get("roll_states")?,
        incidents: row.try_get("incidents")?,
        ltmt: row.try_get("ltmt")?,
        student_count: row.try_get("student_count")?,
        run_at: row.try_get("run_at")?,
    })
}

fn roll_from_row(row: &PgRow) -> Result<Roll> {
    Ok(Roll {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        completed_at: row.try_get("completed_at")?,
    })
}

fn roll_state_from_row(row: &PgRow) -> Result<StudentRollState> {
    let state: String = row.try_get("state")?;
    Ok(StudentRollState {
        id: row.try_get("id")?,
        roll_id: row.try_get("roll_id")?,
        student_id: row.try_get("student_id")?,
        state: state.parse().map_err(Error::Configuration)?,
    })
}

fn student_from_row(row: &PgRow) -> Result<Student> {
    Ok(Student {
        id: row.try_get("id")?,
        first_name: row.try_get("first_name")?,
        last_name: row.try_get("last_name")?,
        photo_url: row.try_get("photo_url")?,
    })
}

/// Loads a small demo data set. Returns `false` if it was already present.
pub async fn seed(store: &PgStore) -> anyhow::Result<bool> {
    let pool = store.pool();
    let students = [
        (
            Uuid::parse_str("3d7f5d6f-24f7-4e8e-8b4b-3e7e44b4a7b2")?,
            "Avery",
            "Lee",
        ),
        (
            Uuid::parse_str("0c22f1f1-9184-4fd4-9b21-28c68a6a89dc")?,
            "Jules",
            "Moreno",
        ),
        (
            Uuid::parse_str("d5a0a1a2-2a3c-44c2-8f73-60b7897a9dd2")?,
            "Kiara",
            "Patel",
        ),
        (
            Uuid::parse_str("7b1e9c44-51d2-4a0f-9e36-2c4f0d8a1b55")?,
            "Noah",
            "Brooks",
        ),
    ];

    let existing: i64 = sqlx::query("SELECT COUNT(*) AS n FROM behavior_groups.students WHERE id = $1")
        .bind(students[0].0)
        .fetch_one(pool)
        .await?
        .get("n");
    if existing > 0 {
        return Ok(false);
    }

    let mut tx = pool.begin().await?;

    for (id, first_name, last_name) in students {
        sqlx::query(
            r#"
            INSERT INTO behavior_groups.students (id, first_name, last_name, photo_url)
            VALUES ($1, $2, $3, NULL)
            "#,
        )
        .bind(id)
        .bind(first_name)
        .bind(last_name)
        .execute(&mut *tx)
        .await?;
    }

    // One roll per week, most recent first; states are listed per student
    // in the same order as `students`.
    use RollState::{Absent, Late, Present, Unmark};
    let now = Utc::now();
    let weekly_states = [
        [Late, Present, Absent, Present],
        [Late, Late, Absent, Present],
        [Absent, Present, Late, Unmark],
        [Late, Present, Present, Present],
        [Late, Absent, Late, Present],
        [Absent, Absent, Late, Present],
    ];

    for (week, states) in weekly_states.iter().enumerate() {
        let completed_at = now - Duration::days(7 * week as i64 + 2);
        let roll_id = Uuid::new_v4();
        sqlx::query(
            "INSERT INTO behavior_groups.rolls (id, name, completed_at) VALUES ($1, $2, $3)",
        )
        .bind(roll_id)
        .bind(format!("Homeroom {}", completed_at.format("%Y-%m-%d")))
        .bind(completed_at)
        .execute(&mut *tx)
        .await?;

        for ((student_id, _, _), state) in students.iter().zip(states) {
            sqlx::query(
                r#"
                INSERT INTO behavior_groups.student_roll_states (id, roll_id, student_id, state)
                VALUES ($1, $2, $3, $4)
                "#,
            )
            .bind(Uuid::new_v4())
            .bind(roll_id)
            .bind(student_id)
            .bind(state.as_str())
            .execute(&mut *tx)
            .await?;
        }
    }

    sqlx::query(
        "INSERT INTO behavior_groups.rolls (id, name, completed_at) VALUES ($1, $2, NULL)",
    )
    .bind(Uuid::new_v4())
    .bind("Homeroom (in progress)")
    .execute(&mut *tx)
    .await?;

    tx.commit().await?;

    let groups = [
        GroupInput {
            name: "Late or absent more than 3 times in 4 weeks".to_string(),
            number_of_weeks: 4,
            roll_states: "late,absent".to_string(),
            incidents: 3,
            ltmt: ">".to_string(),
        },
        GroupInput {
            name: "Rarely late over the term".to_string(),
            number_of_weeks: 8,
            roll_states: "late".to_string(),
            incidents: 2,
            ltmt: "<".to_string(),
        },
    ];
    for input in groups {
        let definition = input.into_definition()?;
        store
            .create_group(&definition)
            .await
            .with_context(|| format!("failed to seed group {:?}", definition.name))?;
    }

    Ok(true)
}

/// Imports `roll_id,student_id,state` rows. The whole file is rejected if
/// any row is malformed.
pub async fn import_csv(store: &PgStore, csv_path: &std::path::Path) -> anyhow::Result<usize> {
    #[derive(serde::Deserialize)]
    struct CsvRow {
        roll_id: Uuid,
        student_id: Uuid,
        state: String,
    }

    let mut reader = csv::Reader::from_path(csv_path)?;
    let mut states = Vec::new();

    for (index, result) in reader.deserialize::<CsvRow>().enumerate() {
        let line = index + 2;
        let row = result.with_context(|| format!("malformed row on line {line}"))?;
        let state = row
            .state
            .trim()
            .parse::<RollState>()
            .map_err(|msg| anyhow::anyhow!("line {line}: {msg}"))?;
        states.push(NewRollState {
            roll_id: row.roll_id,
            student_id: row.student_id,
            state,
        });
    }

    let inserted = store.add_roll_states(&states).await?;
    Ok(inserted.len())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::TimeZone;

    use super::*;
    use crate::config::RecomputeOptions;
    use crate::filter::time_window;
    use crate::recompute::Recomputer;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 2, 9, 0, 0).unwrap()
    }

    async fn student(store: &PgStore, first_name: &str) -> Uuid {
        store
            .create_student(&NewStudent {
                first_name: first_name.to_string(),
                last_name: "Rivera".to_string(),
                photo_url: None,
            })
            .await
            .unwrap()
            .id
    }

    async fn roll(store: &PgStore, completed_at: Option<DateTime<Utc>>) -> Uuid {
        store.create_roll("Homeroom", completed_at).await.unwrap().id
    }

    async fn mark(store: &PgStore, roll_id: Uuid, student_id: Uuid, state: RollState) {
        store
            .add_roll_states(&[NewRollState {
                roll_id,
                student_id,
                state,
            }])
            .await
            .unwrap();
    }

    async fn group(store: &PgStore, weeks: i32, states: &str, incidents: i32, ltmt: &str) -> Uuid {
        let definition = GroupInput {
            name: format!("{states} {ltmt} {incidents} in {weeks} weeks"),
            number_of_weeks: weeks,
            roll_states: states.to_string(),
            incidents,
            ltmt: ltmt.to_string(),
        }
        .into_definition()
        .unwrap();
        store.create_group(&definition).await.unwrap().id
    }

    async fn membership_rows(pool: &PgPool, group_id: Uuid) -> i64 {
        sqlx::query_scalar("SELECT COUNT(*) FROM behavior_groups.group_students WHERE group_id = $1")
            .bind(group_id)
            .fetch_one(pool)
            .await
            .unwrap()
    }

    #[sqlx::test(migrations = "./migrations")]
    async fn completed_rolls_are_selected_by_half_open_window(pool: PgPool) {
        let store = PgStore::new(pool);
        let window = time_window(now(), 4).unwrap();

        let at_now = roll(&store, Some(now())).await;
        let just_inside = roll(&store, Some(window.start + Duration::seconds(1))).await;
        roll(&store, Some(window.start)).await;
        roll(&store, Some(now() + Duration::seconds(1))).await;
        roll(&store, None).await;

        let mut found = store.find_completed_between(window).await.unwrap();
        found.sort();
        let mut expected = vec![at_now, just_inside];
        expected.sort();
        assert_eq!(found, expected);
    }

    #[sqlx::test(migrations = "./migrations")]
    async fn aggregate_counts_matching_states_and_zero_fills(pool: PgPool) {
        let store = PgStore::new(pool);
        let inside = roll(&store, Some(now() - Duration::days(1))).await;
        let other = roll(&store, Some(now() - Duration::days(2))).await;
        let outside = roll(&store, Some(now() - Duration::days(60))).await;

        let late_twice = student(&store, "Avery").await;
        let never_late = student(&store, "Noah").await;
        let elsewhere = student(&store, "Jules").await;

        mark(&store, inside, late_twice, RollState::Late).await;
        mark(&store, other, late_twice, RollState::Absent).await;
        mark(&store, inside, never_late, RollState::Present).await;
        mark(&store, outside, elsewhere, RollState::Late).await;

        let states = RollStateSet::decode("late,absent").unwrap();
        let counts = store
            .aggregate_by_student(&[inside, other], &states)
            .await
            .unwrap();

        assert_eq!(counts, HashMap::from([(late_twice, 2), (never_late, 0)]));
    }

    #[sqlx::test(migrations = "./migrations")]
    async fn recomputation_keeps_only_students_strictly_over_the_threshold(pool: PgPool) {
        let store = Arc::new(PgStore::new(pool));
        let group_id = group(&store, 4, "late,absent", 3, ">").await;

        let a = student(&store, "Avery").await;
        let b = student(&store, "Jules").await;
        let c = student(&store, "Kiara").await;

        let mut inside = Vec::new();
        for days in 1..=5 {
            inside.push(roll(&store, Some(now() - Duration::days(days))).await);
        }
        for roll_id in &inside[..4] {
            mark(&store, *roll_id, a, RollState::Late).await;
        }
        for roll_id in &inside[..3] {
            mark(&store, *roll_id, b, RollState::Absent).await;
            mark(&store, *roll_id, c, RollState::Late).await;
        }
        mark(&store, inside[4], b, RollState::Present).await;
        for days in [29, 30] {
            let old = roll(&store, Some(now() - Duration::days(days))).await;
            mark(&store, old, c, RollState::Absent).await;
        }

        let recomputer = Recomputer::new(Arc::clone(&store), RecomputeOptions::default());
        let summary = recomputer.run_at(now()).await.unwrap();
        assert!(summary.is_success());

        let members = store.list_by_group(group_id).await.unwrap();
        assert_eq!(members.len(), 1);
        assert_eq!(members[0].student_id, a);
        assert_eq!(members[0].incident_count, 4);
        assert_eq!(members[0].full_name, "Avery Rivera");

        let record = store.get_group(group_id).await.unwrap().unwrap();
        assert_eq!(record.student_count, 1);
        assert_eq!(record.run_at, Some(now()));
    }

    #[sqlx::test(migrations = "./migrations")]
    async fn empty_membership_still_refreshes_cached_fields(pool: PgPool) {
        let store = PgStore::new(pool.clone());
        let group_id = group(&store, 2, "absent", 0, ">").await;

        store.materialize(group_id, &[], now()).await.unwrap();

        let record = store.get_group(group_id).await.unwrap().unwrap();
        assert_eq!(record.student_count, 0);
        assert_eq!(record.run_at, Some(now()));
        assert_eq!(membership_rows(&pool, group_id).await, 0);
    }

    #[sqlx::test(migrations = "./migrations")]
    async fn materializing_a_missing_group_writes_nothing(pool: PgPool) {
        let store = PgStore::new(pool.clone());
        let student_id = student(&store, "Avery").await;
        let missing = Uuid::new_v4();

        let err = store
            .materialize(
                missing,
                &[Membership {
                    student_id,
                    incident_count: 2,
                }],
                now(),
            )
            .await
            .unwrap_err();

        assert!(matches!(err, Error::NotFound { .. }), "{err}");
        assert_eq!(membership_rows(&pool, missing).await, 0);
    }

    #[sqlx::test(migrations = "./migrations")]
    async fn deleting_a_group_leaves_no_membership_rows(pool: PgPool) {
        let store = PgStore::new(pool.clone());
        let group_id = group(&store, 4, "late", 0, ">").await;
        let student_id = student(&store, "Avery").await;
        store
            .materialize(
                group_id,
                &[Membership {
                    student_id,
                    incident_count: 1,
                }],
                now(),
            )
            .await
            .unwrap();
        assert_eq!(membership_rows(&pool, group_id).await, 1);

        assert!(store.delete_group(group_id).await.unwrap());
        assert_eq!(membership_rows(&pool, group_id).await, 0);
        assert!(store.get_group(group_id).await.unwrap().is_none());
        assert!(!store.delete_group(group_id).await.unwrap());
    }

    #[sqlx::test(migrations = "./migrations")]
    async fn rebuild_lock_is_held_until_released(pool: PgPool) {
        let store = PgStore::new(pool.clone());
        let mut other = pool.acquire().await.unwrap();

        store.lock_rebuild().await.unwrap();
        let taken: bool = sqlx::query_scalar("SELECT pg_try_advisory_lock($1)")
            .bind(REBUILD_LOCK_KEY)
            .fetch_one(&mut *other)
            .await
            .unwrap();
        assert!(!taken);

        store.unlock_rebuild().await.unwrap();
        let taken: bool = sqlx::query_scalar("SELECT pg_try_advisory_lock($1)")
            .bind(REBUILD_LOCK_KEY)
            .fetch_one(&mut *other)
            .await
            .unwrap();
        assert!(taken);
    }

    #[sqlx::test(migrations = "./migrations")]
    async fn get_roll_returns_the_stored_roll(pool: PgPool) {
        let store = PgStore::new(pool);
        let created = store.create_roll("Homeroom", Some(now())).await.unwrap();

        assert_eq!(store.get_roll(created.id).await.unwrap(), Some(created));
        assert_eq!(store.get_roll(Uuid::new_v4()).await.unwrap(), None);
    }
}
