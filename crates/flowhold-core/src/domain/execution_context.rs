//! Execution context threaded through one flow run
//!
//! The context is single-writer: the scheduler driving a run owns it and is
//! the only code that mutates it. Dynamic sub-branches receive a [`fork`]ed
//! copy; their results reach the parent only through fan-out aggregation.
//!
//! [`fork`]: ExecutionContext::fork

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use super::pause::ResumeTrigger;
use crate::{DataPacket, FlowId, RunId, StepId};

/// One level of dynamic branching on the cursor path
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BranchFrame {
    /// Fan-out step that spawned the branch
    pub step_id: StepId,
    /// Item index of the branch within that fan-out
    pub index: usize,
}

/// Position of a run inside its step/branch graph
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepCursor {
    branch_path: Vec<BranchFrame>,
    step_index: usize,
}

impl StepCursor {
    /// Index of the active step within the current step list
    #[inline]
    pub fn step_index(&self) -> usize {
        self.step_index
    }

    /// Fan-out frames leading to the current step list (empty at top level)
    #[inline]
    pub fn branch_path(&self) -> &[BranchFrame] {
        &self.branch_path
    }

    /// Branch nesting depth
    #[inline]
    pub fn depth(&self) -> usize {
        self.branch_path.len()
    }

    /// Move to the next step
    #[inline]
    pub fn advance(&mut self) {
        self.step_index += 1;
    }

    fn descend(&self, frame: BranchFrame) -> Self {
        let mut branch_path = self.branch_path.clone();
        branch_path.push(frame);
        Self {
            branch_path,
            step_index: 0,
        }
    }
}

/// How a run was last brought back from a pause
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResumeInfo {
    /// Step the run was paused at
    pub step_id: StepId,
    /// Resume path that won
    pub trigger: ResumeTrigger,
    /// When the resume was resolved
    pub resumed_at: DateTime<Utc>,
}

/// Mutable state bag for one flow run
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionContext {
    run_id: RunId,
    flow_id: FlowId,
    variables: HashMap<String, DataPacket>,
    cursor: StepCursor,
    resume_info: Option<ResumeInfo>,
}

/// Immutable copy of an [`ExecutionContext`] suitable for persistence
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextSnapshot {
    /// Run the snapshot belongs to
    pub run_id: RunId,
    /// Flow definition of the run
    pub flow_id: FlowId,
    /// Variable map at snapshot time
    pub variables: HashMap<String, DataPacket>,
    /// Cursor at snapshot time
    pub cursor: StepCursor,
    /// Last resume, if any
    pub resume_info: Option<ResumeInfo>,
}

impl ExecutionContext {
    /// Create an empty context positioned at the first top-level step
    pub fn new(run_id: RunId, flow_id: FlowId) -> Self {
        Self {
            run_id,
            flow_id,
            variables: HashMap::with_capacity(16),
            cursor: StepCursor::default(),
            resume_info: None,
        }
    }

    /// Seed the variable map
    pub fn with_variables(mut self, variables: HashMap<String, DataPacket>) -> Self {
        self.variables.extend(variables);
        self
    }

    /// Run identifier
    #[inline]
    pub fn run_id(&self) -> &RunId {
        &self.run_id
    }

    /// Flow identifier
    #[inline]
    pub fn flow_id(&self) -> &FlowId {
        &self.flow_id
    }

    /// Read a variable
    #[inline]
    pub fn get(&self, key: &str) -> Option<&DataPacket> {
        self.variables.get(key)
    }

    /// Write a variable, returning the previous value
    pub fn set(&mut self, key: impl Into<String>, value: DataPacket) -> Option<DataPacket> {
        self.variables.insert(key.into(), value)
    }

    /// Remove a variable
    pub fn remove(&mut self, key: &str) -> Option<DataPacket> {
        self.variables.remove(key)
    }

    /// All variables
    #[inline]
    pub fn variables(&self) -> &HashMap<String, DataPacket> {
        &self.variables
    }

    /// Current cursor
    #[inline]
    pub fn cursor(&self) -> &StepCursor {
        &self.cursor
    }

    /// Mutable cursor, used by the scheduler to advance
    #[inline]
    pub fn cursor_mut(&mut self) -> &mut StepCursor {
        &mut self.cursor
    }

    /// How the run was last resumed
    #[inline]
    pub fn resume_info(&self) -> Option<&ResumeInfo> {
        self.resume_info.as_ref()
    }

    /// Record the resume path that brought the run back
    pub fn record_resume(&mut self, info: ResumeInfo) {
        self.resume_info = Some(info);
    }

    /// Produce an immutable copy for persistence
    pub fn snapshot(&self) -> ContextSnapshot {
        ContextSnapshot {
            run_id: self.run_id.clone(),
            flow_id: self.flow_id.clone(),
            variables: self.variables.clone(),
            cursor: self.cursor.clone(),
            resume_info: self.resume_info.clone(),
        }
    }

    /// Rehydrate a context for a resuming run
    pub fn restore(snapshot: ContextSnapshot) -> Self {
        Self {
            run_id: snapshot.run_id,
            flow_id: snapshot.flow_id,
            variables: snapshot.variables,
            cursor: snapshot.cursor,
            resume_info: snapshot.resume_info,
        }
    }

    /// Fork a child context for one dynamic branch.
    ///
    /// The child sees a copy of the parent's variables, starts at the first
    /// step of its branch and carries no resume history.
    pub fn fork(&self, child_run_id: RunId, frame: BranchFrame) -> Self {
        Self {
            run_id: child_run_id,
            flow_id: self.flow_id.clone(),
            variables: self.variables.clone(),
            cursor: self.cursor.descend(frame),
            resume_info: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn context() -> ExecutionContext {
        ExecutionContext::new(RunId::from("run-1"), FlowId::from("kyc"))
    }

    #[test]
    fn test_get_set_remove() {
        let mut ctx = context();
        assert!(ctx.get("status").is_none());

        assert!(ctx.set("status", DataPacket::new(json!("pending"))).is_none());
        let previous = ctx.set("status", DataPacket::new(json!("approved")));
        assert_eq!(previous, Some(DataPacket::new(json!("pending"))));
        assert_eq!(ctx.get("status").unwrap().as_value(), &json!("approved"));
        assert_eq!(ctx.variables().len(), 1);

        ctx.remove("status");
        assert!(ctx.get("status").is_none());
    }

    #[test]
    fn test_snapshot_restore_round_trip() {
        let mut ctx = context();
        ctx.set("customer", DataPacket::new(json!({"id": 7, "tier": "gold"})));
        ctx.set("attempts", DataPacket::new(json!(2)));
        ctx.cursor_mut().advance();
        ctx.cursor_mut().advance();

        let snapshot = ctx.snapshot();
        let serialized = serde_json::to_string(&snapshot).unwrap();
        let restored = ExecutionContext::restore(serde_json::from_str(&serialized).unwrap());

        assert_eq!(restored, ctx);
        assert_eq!(restored.cursor().step_index(), 2);
    }

    #[test]
    fn test_snapshot_is_detached_from_later_writes() {
        let mut ctx = context();
        ctx.set("a", DataPacket::new(json!(1)));
        let snapshot = ctx.snapshot();

        ctx.set("a", DataPacket::new(json!(2)));
        ctx.cursor_mut().advance();

        assert_eq!(snapshot.variables["a"].as_value(), &json!(1));
        assert_eq!(snapshot.cursor.step_index(), 0);
    }

    #[test]
    fn test_fork_copies_variables_and_descends_cursor() {
        let mut parent = context();
        parent.set("region", DataPacket::new(json!("eu")));
        parent.cursor_mut().advance();

        let frame = BranchFrame {
            step_id: StepId::from("notify"),
            index: 4,
        };
        let mut child = parent.fork(parent.run_id().child(&frame.step_id, 4), frame.clone());

        assert_eq!(child.run_id().0, "run-1/notify/4");
        assert_eq!(child.get("region").unwrap().as_value(), &json!("eu"));
        assert_eq!(child.cursor().step_index(), 0);
        assert_eq!(child.cursor().branch_path(), &[frame]);
        assert_eq!(child.cursor().depth(), 1);

        child.set("region", DataPacket::new(json!("us")));
        assert_eq!(parent.get("region").unwrap().as_value(), &json!("eu"));
    }
}
