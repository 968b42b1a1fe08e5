use std::sync::{Arc, Mutex, MutexGuard};

use rb_core::types::{RunStatus, Step};
use serde::Serialize;
use uuid::Uuid;

/// Region updates for the UI, keyed by run or task identity.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RunEvent {
    StepAppended {
        task_id: Uuid,
        step: Step,
    },
    RunStatusChanged {
        task_id: Uuid,
        run_id: Uuid,
        status: RunStatus,
    },
    TaskUpdated {
        task_id: Uuid,
    },
}

impl RunEvent {
    /// Identity of the region this event replaces or appends to.
    pub fn target(&self) -> String {
        match self {
            RunEvent::StepAppended { step, .. } => format!("run:{}", step.run_id),
            RunEvent::RunStatusChanged { run_id, .. } => format!("run:{run_id}"),
            RunEvent::TaskUpdated { task_id } => format!("task:{task_id}"),
        }
    }

    pub fn task_id(&self) -> Uuid {
        match self {
            RunEvent::StepAppended { task_id, .. }
            | RunEvent::RunStatusChanged { task_id, .. }
            | RunEvent::TaskUpdated { task_id } => *task_id,
        }
    }
}

/// Broadcast bus built on flume channels.
///
/// Every [`subscribe`](EventBus::subscribe) gets its own receiver that sees
/// each event published afterwards. Publishing never fails: subscribers that
/// dropped their receiver are pruned.
#[derive(Clone, Default)]
pub struct EventBus {
    inner: Arc<Mutex<Vec<flume::Sender<RunEvent>>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    fn senders(&self) -> MutexGuard<'_, Vec<flume::Sender<RunEvent>>> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn subscribe(&self) -> flume::Receiver<RunEvent> {
        let (tx, rx) = flume::unbounded();
        self.senders().push(tx);
        rx
    }

    pub fn publish(&self, event: RunEvent) {
        self.senders().retain(|tx| tx.send(event.clone()).is_ok());
    }

    pub fn subscriber_count(&self) -> usize {
        self.senders().len()
    }
}
