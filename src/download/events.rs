// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Push notifications about task changes.

use serde::Serialize;
use tokio::sync::broadcast;

use super::types::TaskStatus;

/// Events buffered per listener before it starts lagging.
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// A change observers may care about. Serializes as `{"type": ..., "data": ...}`.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "type", content = "data", rename_all = "camelCase")]
pub enum TaskEvent {
    CreateDownloadTask(TaskStatus),
    UpdateDownloadTask(TaskStatus),
    DeleteDownloadTask(String),
    CompleteDownloadTask(String),
    /// Direct reply to a list request; never broadcast.
    DownloadTaskList(Vec<TaskStatus>),
    /// Direct error reply; never broadcast.
    Error(String),
}

impl TaskEvent {
    /// Id of the task the event concerns, if it concerns exactly one.
    pub fn task_id(&self) -> Option<&str> {
        match self {
            TaskEvent::CreateDownloadTask(status) | TaskEvent::UpdateDownloadTask(status) => {
                Some(&status.task_id)
            }
            TaskEvent::DeleteDownloadTask(id) | TaskEvent::CompleteDownloadTask(id) => Some(id),
            TaskEvent::DownloadTaskList(_) | TaskEvent::Error(_) => None,
        }
    }
}

/// Fire-and-forget fan-out of [`TaskEvent`]s to any number of listeners.
#[derive(Debug, Clone)]
pub struct Notifier {
    tx: broadcast::Sender<TaskEvent>,
}

impl Default for Notifier {
    fn default() -> Self {
        Self::new()
    }
}

impl Notifier {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self { tx }
    }

    /// Send an event to every current listener. Having none is fine.
    pub fn broadcast(&self, event: TaskEvent) {
        tracing::trace!(event = ?event.task_id(), "broadcast");
        let _ = self.tx.send(event);
    }

    /// Register a new listener. It sees events sent from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<TaskEvent> {
        self.tx.subscribe()
    }

    /// Number of live listeners.
    pub fn listener_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_broadcast_without_listeners() {
        let notifier = Notifier::new();
        notifier.broadcast(TaskEvent::DeleteDownloadTask("abc".into()));
        assert_eq!(notifier.listener_count(), 0);
    }

    #[tokio::test]
    async fn test_listeners_receive_events() {
        let notifier = Notifier::new();
        let mut rx1 = notifier.subscribe();
        let mut rx2 = notifier.subscribe();

        notifier.broadcast(TaskEvent::CompleteDownloadTask("abc".into()));

        assert_eq!(rx1.recv().await.unwrap(), TaskEvent::CompleteDownloadTask("abc".into()));
        assert_eq!(rx2.recv().await.unwrap().task_id(), Some("abc"));
    }

    #[test]
    fn test_wire_shape() {
        let value = serde_json::to_value(TaskEvent::DeleteDownloadTask("abc".into())).unwrap();
        assert_eq!(value, serde_json::json!({"type": "deleteDownloadTask", "data": "abc"}));
    }
}
