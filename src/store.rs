//! Storage seams used by the group service and the recomputation job.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::Result;
use crate::filter::Window;
use crate::models::{GroupDefinition, GroupMember, GroupRecord, Membership, RollStateSet};

#[async_trait]
pub trait GroupStore: Send + Sync {
    async fn list_groups(&self) -> Result<Vec<GroupRecord>>;

    async fn get_group(&self, id: Uuid) -> Result<Option<GroupRecord>>;

    async fn create_group(&self, definition: &GroupDefinition) -> Result<GroupRecord>;

    /// Returns `None` when no group has the given id.
    async fn update_group(
        &self,
        id: Uuid,
        definition: &GroupDefinition,
    ) -> Result<Option<GroupRecord>>;

    /// Deletes the group and its membership rows. Returns `false` when absent.
    async fn delete_group(&self, id: Uuid) -> Result<bool>;
}

#[async_trait]
pub trait RollStore: Send + Sync {
    /// Ids of rolls whose `completed_at` falls inside `window`.
    async fn find_completed_between(&self, window: Window) -> Result<Vec<Uuid>>;
}

#[async_trait]
pub trait RollStateStore: Send + Sync {
    /// Per-student count of records in `roll_ids` whose state is in `states`.
    /// Every student with any record in `roll_ids` is present, at zero if
    /// none of their records match.
    async fn aggregate_by_student(
        &self,
        roll_ids: &[Uuid],
        states: &RollStateSet,
    ) -> Result<HashMap<Uuid, i64>>;
}

#[async_trait]
pub trait MembershipStore: Send + Sync {
    /// Blocks until no other rebuild holds the lock.
    async fn lock_rebuild(&self) -> Result<()>;

    async fn unlock_rebuild(&self) -> Result<()>;

    /// Deletes every membership row of every group.
    async fn clear_all(&self) -> Result<u64>;

    /// Writes a group's members and its `student_count`/`run_at` together.
    async fn materialize(
        &self,
        group_id: Uuid,
        members: &[Membership],
        run_at: DateTime<Utc>,
    ) -> Result<()>;

    async fn list_by_group(&self, group_id: Uuid) -> Result<Vec<GroupMember>>;
}

/// Everything the recomputation job reads and writes.
pub trait Store: GroupStore + RollStore + RollStateStore + MembershipStore {}

impl<T: GroupStore + RollStore + RollStateStore + MembershipStore> Store for T {}
