//! Cluster-signal intake.
//!
//! Other shards and the outer server push `{sender, type, content}`
//! events at a shard; the loop drains them periodically and forwards
//! each to every live ADO proxy. The queue is the only inbound
//! cross-thread channel besides the transport and the ADO IPC.

use std::sync::mpsc::{channel, Receiver, Sender, TryRecvError};

/// One cluster event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterMessage {
    /// Originating member.
    pub sender: String,
    /// Event type.
    pub event_type: String,
    /// Event content.
    pub content: String,
}

/// Producer handle; cloneable across threads.
pub type ClusterSender = Sender<ClusterMessage>;

/// Shard-side receiver.
pub struct ClusterSignalQueue {
    rx: Receiver<ClusterMessage>,
}

impl ClusterSignalQueue {
    /// Create the queue and its producer handle.
    pub fn new() -> (ClusterSender, ClusterSignalQueue) {
        let (tx, rx) = channel();
        (tx, ClusterSignalQueue { rx })
    }

    /// Drain everything currently queued.
    pub fn drain(&self) -> Vec<ClusterMessage> {
        let mut out = Vec::new();
        loop {
            match self.rx.try_recv() {
                Ok(msg) => out.push(msg),
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => break,
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_drain_returns_queued_events_in_order() {
        let (tx, q) = ClusterSignalQueue::new();
        for i in 0..3 {
            tx.send(ClusterMessage {
                sender: format!("n{i}"),
                event_type: "join".to_string(),
                content: String::new(),
            })
            .unwrap();
        }
        let drained = q.drain();
        assert_eq!(drained.len(), 3);
        assert_eq!(drained[0].sender, "n0");
        assert!(q.drain().is_empty());
    }
}
