//! Background tasks run by the event loop.
//!
//! Each tick every queued task runs one bounded work step. A task that
//! returns `More` stays queued; on `Done` the loop posts a single INFO
//! response to the owning session and retires it. Tasks never hold
//! backend locks across ticks.

use mcas_ado_proto::FindType;
use mcas_protocol::Status;

use crate::index::{FindOutcome, IndexMap, VolatileIndex};

/// Keys visited per find-key work step.
pub const FIND_STEP_BUDGET: usize = 64;

/// What a work step produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskStep {
    /// More work remains; run again next tick.
    More,
    /// Finished; respond and retire.
    Done {
        /// Final status for the INFO response.
        status: Status,
        /// Match position (find-key).
        position: u64,
        /// Matched key bytes (find-key).
        result: Vec<u8>,
    },
}

/// A long-running find over a pool's secondary index.
#[derive(Debug)]
pub struct KeyFindTask {
    /// Session that issued the request.
    pub session_id: u64,
    /// Echoed auth id.
    pub auth_id: u64,
    /// Echoed request id.
    pub request_id: u64,
    /// Pool whose index is scanned.
    pub pool: mcas_backend::PoolHandle,
    expression: String,
    position: u64,
}

impl KeyFindTask {
    /// Create a task starting at `position`.
    pub fn new(
        session_id: u64,
        auth_id: u64,
        request_id: u64,
        pool: mcas_backend::PoolHandle,
        expression: String,
        position: u64,
    ) -> Self {
        Self {
            session_id,
            auth_id,
            request_id,
            pool,
            expression,
            position,
        }
    }

    fn step_index(&mut self, index: &VolatileIndex) -> TaskStep {
        match index.find(&self.expression, self.position, FindType::Regex, FIND_STEP_BUDGET) {
            Ok(FindOutcome::Found { position, key }) => TaskStep::Done {
                status: Status::Ok,
                position,
                result: key.into_bytes(),
            },
            Ok(FindOutcome::Exhausted) => TaskStep::Done {
                status: Status::Fail,
                position: 0,
                result: Vec::new(),
            },
            Ok(FindOutcome::More { next_position }) => {
                self.position = next_position;
                TaskStep::More
            }
            Err(_) => TaskStep::Done {
                status: Status::Inval,
                position: 0,
                result: Vec::new(),
            },
        }
    }

    /// Run one work step against the current index state.
    pub fn do_work(&mut self, indices: &IndexMap) -> TaskStep {
        match indices.get(self.pool) {
            Some(index) => self.step_index(index),
            // index was removed mid-scan
            None => TaskStep::Done {
                status: Status::Inval,
                position: 0,
                result: Vec::new(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn indices_with_keys(pool: u64, keys: &[&str]) -> IndexMap {
        let mut map = IndexMap::new();
        let idx = map.install(pool);
        for k in keys {
            idx.insert(k);
        }
        map
    }

    #[test]
    fn test_find_task_completes_with_match() {
        let indices = indices_with_keys(1, &["cat/1", "dog/1"]);
        let mut task = KeyFindTask::new(0, 0, 0, 1, "dog/".to_string(), 0);
        match task.do_work(&indices) {
            TaskStep::Done { status, position, result } => {
                assert_eq!(status, Status::Ok);
                assert_eq!(position, 1);
                assert_eq!(result, b"dog/1");
            }
            other => panic!("unexpected step: {other:?}"),
        }
    }

    #[test]
    fn test_find_task_spreads_across_steps() {
        let keys: Vec<String> = (0..200).map(|i| format!("k{i:04}")).collect();
        let key_refs: Vec<&str> = keys.iter().map(String::as_str).collect();
        let indices = indices_with_keys(1, &key_refs);
        let mut task = KeyFindTask::new(0, 0, 0, 1, "zzz".to_string(), 0);
        let mut steps = 0;
        loop {
            match task.do_work(&indices) {
                TaskStep::More => steps += 1,
                TaskStep::Done { status, .. } => {
                    assert_eq!(status, Status::Fail);
                    break;
                }
            }
            assert!(steps < 100, "task never completed");
        }
        assert!(steps >= 2, "200 keys should take several budgeted steps");
    }

    #[test]
    fn test_find_task_handles_missing_index() {
        let indices = IndexMap::new();
        let mut task = KeyFindTask::new(0, 0, 0, 1, "x".to_string(), 0);
        assert!(matches!(
            task.do_work(&indices),
            TaskStep::Done { status: Status::Inval, .. }
        ));
    }
}
