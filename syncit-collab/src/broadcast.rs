//! Per-file topic fan-out.
//!
//! Every file id gets its own tokio broadcast channel, so subscribers of one
//! file never see frames for another. Each subscriber gets an independent
//! receiver that buffers up to `capacity` frames; a subscriber that falls
//! further behind loses the oldest frames (reported as `Lagged` on receive).

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::{broadcast, RwLock};

use crate::protocol::Frame;
use crate::session::FileId;

/// Snapshot of a topic's counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TopicStats {
    pub frames_sent: u64,
    /// Frames published while nobody was subscribed.
    pub frames_dropped: u64,
    pub subscribers: usize,
}

/// Broadcast channel for one file.
pub struct Topic {
    sender: broadcast::Sender<Frame>,
    frames_sent: AtomicU64,
    frames_dropped: AtomicU64,
}

impl Topic {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            frames_sent: AtomicU64::new(0),
            frames_dropped: AtomicU64::new(0),
        }
    }

    /// Publish to every current subscriber. Returns how many received it.
    pub fn publish(&self, frame: Frame) -> usize {
        match self.sender.send(frame) {
            Ok(count) => {
                self.frames_sent.fetch_add(1, Ordering::Relaxed);
                count
            }
            Err(_) => {
                self.frames_dropped.fetch_add(1, Ordering::Relaxed);
                0
            }
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Frame> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    pub fn stats(&self) -> TopicStats {
        TopicStats {
            frames_sent: self.frames_sent.load(Ordering::Relaxed),
            frames_dropped: self.frames_dropped.load(Ordering::Relaxed),
            subscribers: self.subscriber_count(),
        }
    }
}

/// Maps file ids to their topics.
pub struct TopicHub {
    topics: RwLock<HashMap<FileId, Arc<Topic>>>,
    capacity: usize,
}

impl TopicHub {
    pub fn new(capacity: usize) -> Self {
        Self {
            topics: RwLock::new(HashMap::new()),
            capacity: capacity.max(1),
        }
    }

    /// Subscribe to a file's topic, creating it if needed.
    ///
    /// The receiver is attached while the map lock is held, so a concurrent
    /// [`prune`](Self::prune) cannot detach the topic in between.
    pub async fn subscribe(&self, file_id: FileId) -> broadcast::Receiver<Frame> {
        // Fast path: read lock
        {
            let topics = self.topics.read().await;
            if let Some(topic) = topics.get(&file_id) {
                return topic.subscribe();
            }
        }

        let mut topics = self.topics.write().await;
        topics
            .entry(file_id)
            .or_insert_with(|| Arc::new(Topic::new(self.capacity)))
            .subscribe()
    }

    /// Publish a frame on a file's topic. A topic nobody has subscribed to
    /// drops the frame.
    pub async fn publish(&self, file_id: FileId, frame: Frame) -> usize {
        let topic = self.topics.read().await.get(&file_id).cloned();
        match topic {
            Some(topic) => topic.publish(frame),
            None => {
                log::trace!("No subscribers for file {file_id}, frame dropped");
                0
            }
        }
    }

    /// Remove a topic whose subscribers have all gone.
    pub async fn prune(&self, file_id: FileId) -> bool {
        let mut topics = self.topics.write().await;
        if topics.get(&file_id).is_some_and(|t| t.subscriber_count() == 0) {
            topics.remove(&file_id);
            return true;
        }
        false
    }

    pub async fn stats(&self, file_id: FileId) -> Option<TopicStats> {
        self.topics.read().await.get(&file_id).map(|t| t.stats())
    }

    pub async fn topic_count(&self) -> usize {
        self.topics.read().await.len()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
