//! The dispatch queue.
//!
//! A single FIFO of [`Task`]s plus the set of instances with a task in
//! flight. Workers take the oldest task that is due and whose instance is
//! idle; everything else stays queued until the next pass.

use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use berth_core::InstanceId;
use tokio::sync::{Notify, watch};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::{DispatchError, DispatchResult};
use crate::task::{Admission, Operation, Task, TaskOutcome};

/// Counters since the queue was created, plus current depth.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueueStats {
    pub pending: usize,
    pub in_flight: usize,
    pub peak_in_flight: usize,
    pub admitted: u64,
    pub completed: u64,
    pub requeued: u64,
    pub duplicates: u64,
    /// Queued tasks dropped because the instance is being deleted.
    pub cancelled: u64,
    pub superseded: u64,
}

#[derive(Default)]
struct QueueState {
    /// Admission order.
    pending: Vec<Task>,
    /// Instance → seq of its running task.
    in_flight: HashMap<InstanceId, u64>,
    next_seq: u64,
    closed: bool,
    stats: QueueStats,
}

enum Pick {
    Ready(usize),
    /// Nothing due; earliest time something might be.
    Wait(Option<Instant>),
}

impl QueueState {
    fn admit(
        &mut self,
        instance_id: &str,
        op: Operation,
        delay: Duration,
        requeues: u32,
    ) -> DispatchResult<Admission> {
        if self.closed {
            return Err(DispatchError::Closed);
        }
        let not_before = Instant::now() + delay;

        if op.is_deprovision() {
            let before = self.pending.len();
            self.pending
                .retain(|t| t.instance_id != instance_id || t.op.is_deprovision());
            let cancelled = (before - self.pending.len()) as u64;
            if cancelled > 0 {
                self.stats.cancelled += cancelled;
                info!(instance_id, cancelled, "deletion cancelled queued work");
            }
        } else if op.is_provisioning()
            && self
                .pending
                .iter()
                .any(|t| t.instance_id == instance_id && t.op.is_deprovision())
        {
            self.stats.superseded += 1;
            debug!(instance_id, %op, "deletion pending, provisioning work dropped");
            return Ok(Admission::Superseded);
        }

        if let Some(existing) = self
            .pending
            .iter_mut()
            .find(|t| t.instance_id == instance_id && t.op == op)
        {
            existing.not_before = existing.not_before.min(not_before);
            self.stats.duplicates += 1;
            return Ok(Admission::Duplicate(existing.seq));
        }

        self.next_seq += 1;
        let seq = self.next_seq;
        debug!(
            seq,
            instance_id,
            %op,
            delay_ms = delay.as_millis() as u64,
            requeues,
            "task admitted"
        );
        self.pending.push(Task {
            seq,
            instance_id: instance_id.to_string(),
            op,
            not_before,
            requeues,
        });
        self.stats.admitted += 1;
        Ok(Admission::Queued(seq))
    }

    fn pick(&self, now: Instant) -> Pick {
        // Instances whose oldest queued task is not due yet. Their later
        // tasks wait behind it, except deletions.
        let mut delayed: HashSet<&str> = HashSet::new();
        let mut wake: Option<Instant> = None;
        for (idx, task) in self.pending.iter().enumerate() {
            if self.in_flight.contains_key(&task.instance_id) {
                continue;
            }
            if delayed.contains(task.instance_id.as_str()) && !task.op.is_deprovision() {
                continue;
            }
            if task.not_before <= now {
                return Pick::Ready(idx);
            }
            wake = Some(wake.map_or(task.not_before, |w| w.min(task.not_before)));
            delayed.insert(&task.instance_id);
        }
        Pick::Wait(wake)
    }

    fn start(&mut self, idx: usize) -> Task {
        let task = self.pending.remove(idx);
        self.in_flight.insert(task.instance_id.clone(), task.seq);
        self.stats.peak_in_flight = self.stats.peak_in_flight.max(self.in_flight.len());
        task
    }
}

pub struct DispatchQueue {
    state: Mutex<QueueState>,
    notify: Notify,
}

impl Default for DispatchQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl DispatchQueue {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            notify: Notify::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Admit `op` for `instance_id` to run as soon as possible.
    pub fn submit(&self, instance_id: &str, op: Operation) -> DispatchResult<Admission> {
        self.submit_after(instance_id, op, Duration::ZERO)
    }

    /// Admit `op` to run no earlier than `delay` from now.
    ///
    /// A deprovision cancels every queued, not yet started task for the
    /// instance. Provisioning work submitted while a deprovision waits is
    /// superseded. An equivalent waiting task is kept instead of adding a
    /// second one.
    pub fn submit_after(
        &self,
        instance_id: &str,
        op: Operation,
        delay: Duration,
    ) -> DispatchResult<Admission> {
        let admission = self.lock().admit(instance_id, op, delay, 0)?;
        self.notify.notify_waiters();
        Ok(admission)
    }

    /// Wait for the next runnable task. `None` once the queue is closed or
    /// `shutdown` fires.
    ///
    /// The task's instance counts as in flight until [`finish`] is called.
    ///
    /// [`finish`]: DispatchQueue::finish
    pub async fn next(&self, shutdown: &mut watch::Receiver<bool>) -> Option<Task> {
        loop {
            if *shutdown.borrow() {
                return None;
            }
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let wake = {
                let mut state = self.lock();
                if state.closed {
                    return None;
                }
                match state.pick(Instant::now()) {
                    Pick::Ready(idx) => return Some(state.start(idx)),
                    Pick::Wait(wake) => wake,
                }
            };

            tokio::select! {
                _ = &mut notified => {}
                _ = sleep_until(wake) => {}
                _ = shutdown.changed() => return None,
            }
        }
    }

    /// Take a due task without waiting.
    pub fn try_next(&self) -> Option<Task> {
        let mut state = self.lock();
        if state.closed {
            return None;
        }
        match state.pick(Instant::now()) {
            Pick::Ready(idx) => Some(state.start(idx)),
            Pick::Wait(_) => None,
        }
    }

    /// Mark `task` finished and apply the handler's outcome.
    pub fn finish(&self, task: &Task, outcome: TaskOutcome) {
        {
            let mut state = self.lock();
            state.in_flight.remove(&task.instance_id);
            state.stats.completed += 1;
            if let TaskOutcome::Requeue { op, delay } = outcome {
                state.stats.requeued += 1;
                if let Err(e) = state.admit(&task.instance_id, op, delay, task.requeues + 1) {
                    warn!(instance_id = %task.instance_id, error = %e, "could not requeue task");
                }
            }
        }
        self.notify.notify_waiters();
    }

    /// Stop handing out tasks. Queued tasks stay queued.
    pub fn close(&self) {
        self.lock().closed = true;
        self.notify.notify_waiters();
    }

    pub fn is_idle(&self) -> bool {
        let state = self.lock();
        state.pending.is_empty() && state.in_flight.is_empty()
    }

    /// Wait until nothing is queued or running.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.is_idle() {
                return;
            }
            notified.await;
        }
    }

    pub fn is_in_flight(&self, instance_id: &str) -> bool {
        self.lock().in_flight.contains_key(instance_id)
    }

    /// Operations queued for `instance_id`, oldest first.
    pub fn pending_ops(&self, instance_id: &str) -> Vec<Operation> {
        self.lock()
            .pending
            .iter()
            .filter(|t| t.instance_id == instance_id)
            .map(|t| t.op.clone())
            .collect()
    }

    pub fn stats(&self) -> QueueStats {
        let state = self.lock();
        QueueStats {
            pending: state.pending.len(),
            in_flight: state.in_flight.len(),
            ..state.stats.clone()
        }
    }
}

async fn sleep_until(wake: Option<Instant>) {
    match wake {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[tokio::test]
    async fn tasks_come_out_in_admission_order() {
        let queue = DispatchQueue::new();
        queue.submit("a", Operation::Provision).unwrap();
        queue.submit("b", Operation::Provision).unwrap();
        queue.submit("c", Operation::CheckStatus).unwrap();

        let order: Vec<String> = std::iter::from_fn(|| queue.try_next())
            .map(|t| t.instance_id)
            .collect();
        assert_eq!(order, vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn busy_instance_is_skipped_not_dropped() {
        let queue = DispatchQueue::new();
        queue.submit("a", Operation::Provision).unwrap();
        queue.submit("a", Operation::CheckStatus).unwrap();
        queue.submit("b", Operation::Provision).unwrap();

        let first = queue.try_next().unwrap();
        assert_eq!(first.instance_id, "a");
        let second = queue.try_next().unwrap();
        assert_eq!(second.instance_id, "b");
        assert!(queue.try_next().is_none());
        assert_eq!(queue.pending_ops("a"), vec![Operation::CheckStatus]);

        queue.finish(&first, TaskOutcome::Done);
        let third = queue.try_next().unwrap();
        assert_eq!(third.instance_id, "a");
        assert_eq!(third.op, Operation::CheckStatus);
    }

    #[tokio::test]
    async fn deprovision_cancels_queued_work_and_supersedes_provision() {
        let queue = DispatchQueue::new();
        queue.submit("a", Operation::Provision).unwrap();
        queue.submit("a", Operation::CheckStatus).unwrap();
        queue.submit("b", Operation::Provision).unwrap();

        assert!(matches!(
            queue.submit("a", Operation::Deprovision).unwrap(),
            Admission::Queued(_)
        ));
        assert_eq!(queue.pending_ops("a"), vec![Operation::Deprovision]);
        assert_eq!(queue.pending_ops("b"), vec![Operation::Provision]);
        assert_eq!(queue.stats().cancelled, 2);

        assert_eq!(
            queue.submit("a", Operation::Provision).unwrap(),
            Admission::Superseded
        );
        assert_eq!(queue.submit("a", Operation::CheckStatus).unwrap(), Admission::Queued(5));
    }

    #[tokio::test]
    async fn provision_finishing_after_delete_is_not_requeued() {
        let queue = DispatchQueue::new();
        queue.submit("a", Operation::Provision).unwrap();
        let running = queue.try_next().unwrap();

        queue.submit("a", Operation::Deprovision).unwrap();
        assert!(queue.try_next().is_none(), "instance still in flight");

        queue.finish(
            &running,
            TaskOutcome::requeue(Operation::Provision, Duration::ZERO),
        );
        assert_eq!(queue.stats().superseded, 1);
        let next = queue.try_next().unwrap();
        assert_eq!(next.op, Operation::Deprovision);
    }

    #[tokio::test]
    async fn equivalent_tasks_are_deduplicated() {
        let queue = DispatchQueue::new();
        let first = queue.submit("a", Operation::CheckStatus).unwrap();
        let second = queue.submit("a", Operation::CheckStatus).unwrap();
        assert_eq!(first, Admission::Queued(1));
        assert_eq!(second, Admission::Duplicate(1));

        let params = BTreeMap::from([("flavor".to_string(), "m1.large".to_string())]);
        queue
            .submit("a", Operation::Reconfigure(params.clone()))
            .unwrap();
        let other = BTreeMap::from([("flavor".to_string(), "m1.xlarge".to_string())]);
        queue.submit("a", Operation::Reconfigure(other)).unwrap();
        assert_eq!(queue.stats().pending, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn delayed_task_waits_but_does_not_block_other_instances() {
        let queue = DispatchQueue::new();
        queue
            .submit_after("a", Operation::Provision, Duration::from_secs(10))
            .unwrap();
        queue.submit("a", Operation::CheckStatus).unwrap();
        queue.submit("b", Operation::Provision).unwrap();

        let task = queue.try_next().unwrap();
        assert_eq!(task.instance_id, "b");
        queue.finish(&task, TaskOutcome::Done);
        // a's check waits behind its delayed provision.
        assert!(queue.try_next().is_none());

        tokio::time::advance(Duration::from_secs(10)).await;
        let task = queue.try_next().unwrap();
        assert_eq!((task.instance_id.as_str(), &task.op), ("a", &Operation::Provision));
    }

    #[tokio::test(start_paused = true)]
    async fn deletion_jumps_a_delayed_retry() {
        let queue = DispatchQueue::new();
        queue
            .submit_after("a", Operation::Deprovision, Duration::from_secs(60))
            .unwrap();
        queue.submit("a", Operation::Deprovision).unwrap();
        let task = queue.try_next().unwrap();
        assert_eq!(task.op, Operation::Deprovision);
        assert_eq!(queue.stats().duplicates, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn next_wakes_when_a_delayed_task_becomes_due() {
        let queue = DispatchQueue::new();
        let (_tx, mut rx) = watch::channel(false);
        queue
            .submit_after("a", Operation::Provision, Duration::from_secs(5))
            .unwrap();

        let started = Instant::now();
        let task = queue.next(&mut rx).await.unwrap();
        assert_eq!(task.instance_id, "a");
        assert!(started.elapsed() >= Duration::from_secs(5));
    }

    #[tokio::test]
    async fn closed_queue_rejects_and_stops() {
        let queue = DispatchQueue::new();
        let (_tx, mut rx) = watch::channel(false);
        queue.submit("a", Operation::Provision).unwrap();
        queue.close();
        assert_eq!(
            queue.submit("b", Operation::Provision),
            Err(DispatchError::Closed)
        );
        assert!(queue.next(&mut rx).await.is_none());
    }
}
