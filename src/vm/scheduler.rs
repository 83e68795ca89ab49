//! Task bookkeeping behind the `Spawn` opcode.
//!
//! Tasks currently run to completion as soon as they are spawned: the VM
//! drains the run queue before resuming the spawning frame. The states and
//! queue exist so a preemptive policy can slot in without touching the
//! instruction set.

use std::collections::VecDeque;

use tracing::debug;

use super::value::GcRef;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TaskId(pub usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Ready,
    Running,
    Yielded,
    Completed,
}

#[derive(Debug, Clone)]
pub struct Task {
    pub id: TaskId,
    /// Zero-argument closure holding the task body.
    pub closure: GcRef,
    pub state: TaskState,
}

#[derive(Debug, Default)]
pub struct Scheduler {
    queue: VecDeque<Task>,
    running: Vec<Task>,
    next_id: usize,
    completed: usize,
}

impl Scheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a task in the `Ready` state.
    pub fn spawn(&mut self, closure: GcRef) -> TaskId {
        let id = TaskId(self.next_id);
        self.next_id += 1;
        debug!(task = id.0, "task spawned");
        self.queue.push_back(Task {
            id,
            closure,
            state: TaskState::Ready,
        });
        id
    }

    /// Pop the next ready task and mark it `Running`.
    pub fn next_ready(&mut self) -> Option<Task> {
        let mut task = self.queue.pop_front()?;
        task.state = TaskState::Running;
        self.running.push(task.clone());
        Some(task)
    }

    /// Move a running task back to the queue so another task can run first.
    pub fn yield_task(&mut self, id: TaskId) {
        if let Some(pos) = self.running.iter().rposition(|t| t.id == id) {
            let mut task = self.running.remove(pos);
            task.state = TaskState::Yielded;
            self.queue.push_back(task);
        }
    }

    /// Mark a running task `Completed` and forget it.
    pub fn complete(&mut self, id: TaskId) {
        if let Some(pos) = self.running.iter().rposition(|t| t.id == id) {
            self.running.remove(pos);
            self.completed += 1;
            debug!(task = id.0, "task completed");
        }
    }

    pub fn state(&self, id: TaskId) -> TaskState {
        if let Some(task) = self.running.iter().find(|t| t.id == id) {
            return task.state;
        }
        if let Some(task) = self.queue.iter().find(|t| t.id == id) {
            return task.state;
        }
        TaskState::Completed
    }

    pub fn has_ready(&self) -> bool {
        !self.queue.is_empty()
    }

    pub fn completed_count(&self) -> usize {
        self.completed
    }

    /// Closures of every task that has not finished; the collector treats them as roots.
    pub fn roots(&self) -> impl Iterator<Item = GcRef> + '_ {
        self.queue
            .iter()
            .chain(self.running.iter())
            .map(|t| t.closure)
    }

    /// Drop all pending work, e.g. after a runtime fault.
    pub fn clear(&mut self) {
        self.queue.clear();
        self.running.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_task_lifecycle() {
        let mut sched = Scheduler::new();
        let a = sched.spawn(GcRef(1));
        let b = sched.spawn(GcRef(2));
        assert_eq!(sched.state(a), TaskState::Ready);

        let task = sched.next_ready().unwrap();
        assert_eq!(task.id, a);
        assert_eq!(sched.state(a), TaskState::Running);

        sched.yield_task(a);
        assert_eq!(sched.state(a), TaskState::Yielded);

        // FIFO: b was queued before a yielded.
        assert_eq!(sched.next_ready().unwrap().id, b);
        sched.complete(b);
        assert_eq!(sched.state(b), TaskState::Completed);

        assert_eq!(sched.next_ready().unwrap().id, a);
        sched.complete(a);
        assert!(!sched.has_ready());
        assert_eq!(sched.completed_count(), 2);
    }

    #[test]
    fn test_roots_cover_pending_and_running() {
        let mut sched = Scheduler::new();
        sched.spawn(GcRef(4));
        sched.spawn(GcRef(5));
        sched.next_ready();
        let mut roots: Vec<GcRef> = sched.roots().collect();
        roots.sort();
        assert_eq!(roots, vec![GcRef(4), GcRef(5)]);
    }
}
