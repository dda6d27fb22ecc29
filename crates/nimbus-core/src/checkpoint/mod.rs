//! Checkpointing: the Executor's crash-recovery mechanism (spec §4.3, §4.5).
//!
//! A checkpoint's `state` column holds a [`CheckpointState`]: the outputs
//! produced by every step completed so far, a cursor into the plan's
//! position order, and the idempotency keys already consumed (so a resumed
//! execution can tell whether a tool service call it's about to retry was
//! already accepted).

use std::collections::HashMap;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use uuid::Uuid;

use nimbus_db::models::Checkpoint;
use nimbus_db::queries::checkpoints;

/// Checkpoints larger than this are rejected outright rather than silently
/// truncated (spec §4.5).
pub const MAX_CHECKPOINT_BYTES: usize = 1024 * 1024;

/// The durable state an in-flight plan execution checkpoints after every
/// successful step.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CheckpointState {
    pub step_outputs_so_far: HashMap<Uuid, serde_json::Value>,
    pub cursor: usize,
    pub idempotency_keys_used: HashMap<Uuid, String>,
}

/// Persist a new checkpoint for `operation_id` (the task id) at `step`
/// (the executor's monotonic step counter, not a step's DB position).
///
/// Rejects checkpoints whose serialized size exceeds [`MAX_CHECKPOINT_BYTES`].
/// The underlying `operation_id`/`step` monotonicity guard lives in
/// [`nimbus_db::queries::checkpoints::save`].
pub async fn save(pool: &PgPool, operation_id: Uuid, step: i64, state: &CheckpointState) -> Result<Checkpoint> {
    let value = serde_json::to_value(state).context("failed to serialize checkpoint state")?;
    let encoded_len = serde_json::to_vec(&value).context("failed to measure checkpoint size")?.len();
    if encoded_len > MAX_CHECKPOINT_BYTES {
        bail!("checkpoint for operation {operation_id} at step {step} is {encoded_len} bytes, exceeding the {MAX_CHECKPOINT_BYTES}-byte limit");
    }

    checkpoints::save(pool, operation_id, step, value).await
}

/// Load the most recent checkpoint for `operation_id`, decoded into
/// [`CheckpointState`]. Returns `None` if no checkpoint has been recorded.
pub async fn load_latest(pool: &PgPool, operation_id: Uuid) -> Result<Option<(Checkpoint, CheckpointState)>> {
    let Some(checkpoint) = checkpoints::get_latest(pool, operation_id).await? else {
        return Ok(None);
    };
    let state: CheckpointState =
        serde_json::from_value(checkpoint.state.clone()).context("failed to deserialize checkpoint state")?;
    Ok(Some((checkpoint, state)))
}

/// List every checkpoint recorded for an operation, oldest first.
pub async fn list(pool: &PgPool, operation_id: Uuid) -> Result<Vec<Checkpoint>> {
    checkpoints::list(pool, operation_id).await
}

/// Delete all checkpoints for an operation. Intended to run once the
/// owning task has reached a terminal status.
pub async fn delete_all(pool: &PgPool, operation_id: Uuid) -> Result<u64> {
    checkpoints::delete_all(pool, operation_id).await
}
