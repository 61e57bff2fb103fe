//! Bookkeeping for a single solve phase's active/cancelled/restarted tasks.
//!
//! Grounded in the teacher's `SubagentRegistry` (DashMap-backed status
//! tracking with a recursive pause/resume/kill API) and in
//! `myagent/ws/plan_solver.py`'s `_active_solver_tasks` /
//! `_restart_requests` / `_results_map` / `_task_key_map`, all serialized by
//! one mutex (spec §3, §5). Cancellation needs no request set of its own: a
//! running task's token is cancelled immediately, in place.
//!
//! The actual `JoinHandle`s being awaited live in the pipeline's local
//! `FuturesUnordered` (a snapshot outside the mutex, per spec §5); this
//! registry only tracks which keys are currently active (via their
//! `CancellationToken`) plus the external-control-facing sets.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use plansolve_core::TaskKey;
use tokio_util::sync::CancellationToken;

struct Inner<Tsk, R> {
    task_key_map: HashMap<TaskKey, Tsk>,
    active_cancel: HashMap<TaskKey, CancellationToken>,
    restart_requests: HashSet<TaskKey>,
    results_map: HashMap<TaskKey, R>,
}

impl<Tsk, R> Default for Inner<Tsk, R> {
    fn default() -> Self {
        Self {
            task_key_map: HashMap::new(),
            active_cancel: HashMap::new(),
            restart_requests: HashSet::new(),
            results_map: HashMap::new(),
        }
    }
}

pub struct ActiveSolverRegistry<Tsk, R> {
    inner: Mutex<Inner<Tsk, R>>,
}

impl<Tsk: Clone, R: Clone> Default for ActiveSolverRegistry<Tsk, R> {
    fn default() -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
        }
    }
}

impl<Tsk: Clone, R: Clone> ActiveSolverRegistry<Tsk, R> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Clears all state and records the original task set for this phase.
    pub fn reset(&self, tasks: Vec<(TaskKey, Tsk)>) {
        let mut inner = self.inner.lock().unwrap();
        *inner = Inner::default();
        inner.task_key_map = tasks.into_iter().collect();
    }

    pub fn task_key_map_insert(&self, key: TaskKey, task: Tsk) {
        let mut inner = self.inner.lock().unwrap();
        inner.task_key_map.insert(key, task);
    }

    pub fn mark_active(&self, key: TaskKey, cancel: CancellationToken) {
        let mut inner = self.inner.lock().unwrap();
        inner.active_cancel.insert(key, cancel);
    }

    pub fn mark_inactive(&self, key: &TaskKey) {
        let mut inner = self.inner.lock().unwrap();
        inner.active_cancel.remove(key);
    }

    pub fn is_active(&self, key: &TaskKey) -> bool {
        self.inner.lock().unwrap().active_cancel.contains_key(key)
    }

    /// Cancel a running task by key. Returns true if an active task was
    /// found and signalled.
    pub fn request_cancel(&self, key: &TaskKey) -> bool {
        let inner = self.inner.lock().unwrap();
        if let Some(token) = inner.active_cancel.get(key) {
            token.cancel();
            true
        } else {
            false
        }
    }

    /// Requests that a task be restarted: cancels it if running and marks
    /// the key for relaunch on the scheduler's next iteration.
    pub fn request_restart(&self, key: &TaskKey) {
        let mut inner = self.inner.lock().unwrap();
        inner.restart_requests.insert(key.clone());
        if let Some(token) = inner.active_cancel.get(key) {
            token.cancel();
        }
    }

    /// Snapshot of keys currently requested for restart.
    pub fn pending_restarts(&self) -> Vec<TaskKey> {
        self.inner
            .lock()
            .unwrap()
            .restart_requests
            .iter()
            .cloned()
            .collect()
    }

    pub fn clear_restart(&self, key: &TaskKey) {
        self.inner.lock().unwrap().restart_requests.remove(key);
    }

    pub fn task_for(&self, key: &TaskKey) -> Option<Tsk> {
        self.inner.lock().unwrap().task_key_map.get(key).cloned()
    }

    pub fn has_active(&self) -> bool {
        !self.inner.lock().unwrap().active_cancel.is_empty()
    }

    pub fn has_pending_restarts(&self) -> bool {
        !self.inner.lock().unwrap().restart_requests.is_empty()
    }

    pub fn store_result(&self, key: TaskKey, result: R) {
        self.inner.lock().unwrap().results_map.insert(key, result);
    }

    pub fn results_snapshot(&self) -> HashMap<TaskKey, R> {
        self.inner.lock().unwrap().results_map.clone()
    }

    pub fn known_keys(&self) -> HashSet<TaskKey> {
        self.inner.lock().unwrap().task_key_map.keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancel_on_inactive_task_returns_false() {
        let registry: ActiveSolverRegistry<u32, String> = ActiveSolverRegistry::new();
        let key = TaskKey::from_id(1);
        assert!(!registry.request_cancel(&key));
    }

    #[test]
    fn cancel_on_active_task_signals_token() {
        let registry: ActiveSolverRegistry<u32, String> = ActiveSolverRegistry::new();
        let key = TaskKey::from_id(1);
        let token = CancellationToken::new();
        registry.mark_active(key.clone(), token.clone());
        assert!(registry.request_cancel(&key));
        assert!(token.is_cancelled());
    }

    #[test]
    fn restart_request_marks_key_pending_and_cancels_if_active() {
        let registry: ActiveSolverRegistry<u32, String> = ActiveSolverRegistry::new();
        let key = TaskKey::from_id(2);
        let token = CancellationToken::new();
        registry.mark_active(key.clone(), token.clone());
        registry.request_restart(&key);
        assert!(token.is_cancelled());
        assert!(registry.pending_restarts().contains(&key));
        registry.clear_restart(&key);
        assert!(registry.pending_restarts().is_empty());
    }

    #[test]
    fn reset_clears_previous_phase_state() {
        let registry: ActiveSolverRegistry<u32, String> = ActiveSolverRegistry::new();
        let key = TaskKey::from_id(3);
        registry.mark_active(key.clone(), CancellationToken::new());
        registry.store_result(key.clone(), "r".to_string());
        registry.reset(vec![(TaskKey::from_id(4), 4)]);
        assert!(!registry.is_active(&key));
        assert!(registry.results_snapshot().is_empty());
        assert_eq!(registry.task_for(&TaskKey::from_id(4)), Some(4));
    }
}
