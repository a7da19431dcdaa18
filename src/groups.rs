//! Group maintenance. Every write is validated before it reaches storage.

use uuid::Uuid;

use crate::error::{Error, Result};
use crate::models::{GroupMember, GroupRecord};
use crate::store::{GroupStore, MembershipStore};
use crate::validation::{GroupInput, GroupPatch};

pub async fn create_group<S: GroupStore + ?Sized>(store: &S, input: GroupInput) -> Result<GroupRecord> {
    let definition = input.into_definition()?;
    let group = store.create_group(&definition).await?;
    tracing::info!(group_id = %group.id, name = %group.name, "Group created");
    Ok(group)
}

pub async fn get_group<S: GroupStore + ?Sized>(store: &S, id: Uuid) -> Result<GroupRecord> {
    store
        .get_group(id)
        .await?
        .ok_or_else(|| Error::not_found("group", id))
}

/// Applies a partial edit. The merged definition is validated as a whole,
/// and the cached `student_count`/`run_at` are left untouched.
pub async fn update_group<S: GroupStore + ?Sized>(
    store: &S,
    id: Uuid,
    patch: GroupPatch,
) -> Result<GroupRecord> {
    let existing = get_group(store, id).await?;
    let definition = patch.merge(&existing).into_definition()?;

    let group = store
        .update_group(id, &definition)
        .await?
        .ok_or_else(|| Error::not_found("group", id))?;
    tracing::info!(group_id = %id, "Group updated");
    Ok(group)
}

pub async fn delete_group<S: GroupStore + ?Sized>(store: &S, id: Uuid) -> Result<()> {
    if !store.delete_group(id).await? {
        return Err(Error::not_found("group", id));
    }
    tracing::info!(group_id = %id, "Group deleted");
    Ok(())
}

/// Members of the requested group from its last recomputation.
pub async fn group_students<S: GroupStore + MembershipStore + ?Sized>(
    store: &S,
    id: Uuid,
) -> Result<Vec<GroupMember>> {
    get_group(store, id).await?;
    store.list_by_group(id).await
}
