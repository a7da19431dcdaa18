//! In-memory store used by unit tests.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::filter::Window;
use crate::models::{
    GroupDefinition, GroupMember, GroupRecord, Membership, Roll, RollState, RollStateSet, Student,
    StudentRollState,
};
use crate::store::{GroupStore, MembershipStore, RollStateStore, RollStore};

#[derive(Default)]
struct State {
    groups: BTreeMap<Uuid, GroupRecord>,
    rolls: Vec<Roll>,
    roll_states: Vec<StudentRollState>,
    students: HashMap<Uuid, Student>,
    members: Vec<(Uuid, Membership)>,
    failing: HashSet<Uuid>,
    delays: HashMap<Uuid, Duration>,
}

#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<State>,
    aggregate_calls: AtomicUsize,
    active_rebuilds: AtomicUsize,
    max_rebuilds: AtomicUsize,
}

impl MemoryStore {
    /// Inserts a group row as-is, bypassing validation.
    pub fn insert_group(
        &self,
        name: &str,
        number_of_weeks: i32,
        roll_states: &str,
        incidents: i32,
        ltmt: &str,
    ) -> Uuid {
        let id = Uuid::new_v4();
        self.state.lock().unwrap().groups.insert(
            id,
            GroupRecord {
                id,
                name: name.to_string(),
                number_of_weeks,
                roll_states: roll_states.to_string(),
                incidents,
                ltmt: ltmt.to_string(),
                student_count: 0,
                run_at: None,
            },
        );
        id
    }

    pub fn add_student(&self, first_name: &str, last_name: &str) -> Uuid {
        let id = Uuid::new_v4();
        self.state.lock().unwrap().students.insert(
            id,
            Student {
                id,
                first_name: first_name.to_string(),
                last_name: last_name.to_string(),
                photo_url: None,
            },
        );
        id
    }

    pub fn add_roll(&self, completed_at: Option<DateTime<Utc>>) -> Uuid {
        let id = Uuid::new_v4();
        self.state.lock().unwrap().rolls.push(Roll {
            id,
            name: format!("Roll {id}"),
            completed_at,
        });
        id
    }

    pub fn record(&self, roll_id: Uuid, student_id: Uuid, state: RollState) {
        self.state.lock().unwrap().roll_states.push(StudentRollState {
            id: Uuid::new_v4(),
            roll_id,
            student_id,
            state,
        });
    }

    pub fn add_member(&self, group_id: Uuid, student_id: Uuid, incident_count: i64) {
        self.state.lock().unwrap().members.push((
            group_id,
            Membership {
                student_id,
                incident_count,
            },
        ));
    }

    pub fn fail_materialize(&self, group_id: Uuid) {
        self.state.lock().unwrap().failing.insert(group_id);
    }

    pub fn delay_materialize(&self, group_id: Uuid, delay: Duration) {
        self.state.lock().unwrap().delays.insert(group_id, delay);
    }

    pub fn aggregate_calls(&self) -> usize {
        self.aggregate_calls.load(Ordering::SeqCst)
    }

    pub fn max_concurrent_rebuilds(&self) -> usize {
        self.max_rebuilds.load(Ordering::SeqCst)
    }

    pub fn rebuild_locks_held(&self) -> usize {
        self.active_rebuilds.load(Ordering::SeqCst)
    }

    pub fn membership_rows(&self) -> usize {
        self.state.lock().unwrap().members.len()
    }
}

#[async_trait]
impl GroupStore for MemoryStore {
    async fn list_groups(&self) -> Result<Vec<GroupRecord>> {
        Ok(self.state.lock().unwrap().groups.values().cloned().collect())
    }

    async fn get_group(&self, id: Uuid) -> Result<Option<GroupRecord>> {
        Ok(self.state.lock().unwrap().groups.get(&id).cloned())
    }

    async fn create_group(&self, definition: &GroupDefinition) -> Result<GroupRecord> {
        let id = Uuid::new_v4();
        let record = GroupRecord {
            id,
            name: definition.name.clone(),
            number_of_weeks: definition.rule.number_of_weeks,
            roll_states: definition.rule.states.encode(),
            incidents: definition.rule.incidents,
            ltmt: definition.rule.comparison.as_str().to_string(),
            student_count: 0,
            run_at: None,
        };
        self.state.lock().unwrap().groups.insert(id, record.clone());
        Ok(record)
    }

    async fn update_group(
        &self,
        id: Uuid,
        definition: &GroupDefinition,
    ) -> Result<Option<GroupRecord>> {
        let mut state = self.state.lock().unwrap();
        let Some(record) = state.groups.get_mut(&id) else {
            return Ok(None);
        };
        record.name = definition.name.clone();
        record.number_of_weeks = definition.rule.number_of_weeks;
        record.roll_states = definition.rule.states.encode();
        record.incidents = definition.rule.incidents;
        record.ltmt = definition.rule.comparison.as_str().to_string();
        Ok(Some(record.clone()))
    }

    async fn delete_group(&self, id: Uuid) -> Result<bool> {
        let mut state = self.state.lock().unwrap();
        state.members.retain(|(group_id, _)| *group_id != id);
        Ok(state.groups.remove(&id).is_some())
    }
}

#[async_trait]
impl RollStore for MemoryStore {
    async fn find_completed_between(&self, window: Window) -> Result<Vec<Uuid>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .rolls
            .iter()
            .filter(|roll| {
                roll.completed_at
                    .is_some_and(|at| window.start < at && at <= window.end)
            })
            .map(|roll| roll.id)
            .collect())
    }
}

#[async_trait]
impl RollStateStore for MemoryStore {
    async fn aggregate_by_student(
        &self,
        roll_ids: &[Uuid],
        states: &RollStateSet,
    ) -> Result<HashMap<Uuid, i64>> {
        self.aggregate_calls.fetch_add(1, Ordering::SeqCst);
        let state = self.state.lock().unwrap();
        let mut counts = HashMap::new();
        for record in &state.roll_states {
            if !roll_ids.contains(&record.roll_id) {
                continue;
            }
            let count = counts.entry(record.student_id).or_insert(0);
            if states.iter().any(|s| s == record.state) {
                *count += 1;
            }
        }
        Ok(counts)
    }
}

#[async_trait]
impl MembershipStore for MemoryStore {
    async fn lock_rebuild(&self) -> Result<()> {
        let active = self.active_rebuilds.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_rebuilds.fetch_max(active, Ordering::SeqCst);
        Ok(())
    }

    async fn unlock_rebuild(&self) -> Result<()> {
        self.active_rebuilds.fetch_sub(1, Ordering::SeqCst);
        Ok(())
    }

    async fn clear_all(&self) -> Result<u64> {
        let mut state = self.state.lock().unwrap();
        let cleared = state.members.len() as u64;
        state.members.clear();
        Ok(cleared)
    }

    async fn materialize(
        &self,
        group_id: Uuid,
        members: &[Membership],
        run_at: DateTime<Utc>,
    ) -> Result<()> {
        let delay = self.state.lock().unwrap().delays.get(&group_id).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.state.lock().unwrap();
        if state.failing.contains(&group_id) {
            return Err(Error::Storage(sqlx::Error::PoolTimedOut));
        }
        let Some(group) = state.groups.get_mut(&group_id) else {
            return Err(Error::not_found("group", group_id));
        };
        group.student_count = members.len() as i32;
        group.run_at = Some(run_at);
        state
            .members
            .extend(members.iter().map(|member| (group_id, *member)));
        Ok(())
    }

    async fn list_by_group(&self, group_id: Uuid) -> Result<Vec<GroupMember>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .members
            .iter()
            .filter(|(id, _)| *id == group_id)
            .filter_map(|(_, member)| {
                let student = state.students.get(&member.student_id)?;
                Some(GroupMember {
                    student_id: student.id,
                    first_name: student.first_name.clone(),
                    last_name: student.last_name.clone(),
                    full_name: format!("{} {}", student.first_name, student.last_name),
                    incident_count: member.incident_count as i32,
                })
            })
            .collect())
    }
}
