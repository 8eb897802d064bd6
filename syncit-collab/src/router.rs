//! Open/edit/close state machine over the session registry.
//!
//! Per file id:
//! ```text
//!            open / edit                 close (gate acquired, flush ok)
//!  Closed ───────────────► Open ───────────────────────────────► Closed
//!                           │ ▲
//!                           └─┘ open / edit / close (contended)
//! ```
//!
//! | Event | Action                                       | Frame published          |
//! |-------|----------------------------------------------|--------------------------|
//! | open  | get-or-load session, try gate, read content  | open response (or empty) |
//! | edit  | get-or-seed session, replace content         | the raw edit bytes       |
//! | close | try gate, flush to persistence, evict        | none                     |

use std::sync::Arc;

use thiserror::Error;

use crate::broadcast::TopicHub;
use crate::protocol::{Destination, EditFrame, EventKind, Frame, FrameError, OpenResponse};
use crate::registry::SessionRegistry;
use crate::session::{FileId, ReplaceOutcome};
use crate::storage::{PersistenceError, PersistenceGateway};

/// What a close did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseOutcome {
    /// Content was saved and the session evicted.
    Flushed,
    /// No session was open for the file.
    Absent,
    /// The gate was busy; the session stays open until a later close.
    Contended,
}

/// Result of [`Router::shutdown`].
#[derive(Debug, Default)]
pub struct ShutdownReport {
    pub flushed: Vec<FileId>,
    pub contended: Vec<FileId>,
    pub failed: Vec<(FileId, PersistenceError)>,
}

impl ShutdownReport {
    pub fn is_clean(&self) -> bool {
        self.contended.is_empty() && self.failed.is_empty()
    }
}

/// Router errors.
#[derive(Debug, Error)]
pub enum RouterError {
    #[error(transparent)]
    Frame(#[from] FrameError),
    #[error("persistence failed: {0}")]
    Persistence(#[from] PersistenceError),
}

/// Drives sessions in response to client events and publishes frames.
pub struct Router {
    registry: Arc<SessionRegistry>,
    topics: Arc<TopicHub>,
    store: Arc<dyn PersistenceGateway>,
}

impl Router {
    pub fn new(
        registry: Arc<SessionRegistry>,
        topics: Arc<TopicHub>,
        store: Arc<dyn PersistenceGateway>,
    ) -> Self {
        Self {
            registry,
            topics,
            store,
        }
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    pub fn topics(&self) -> &Arc<TopicHub> {
        &self.topics
    }

    pub fn store(&self) -> &Arc<dyn PersistenceGateway> {
        &self.store
    }

    /// Route one inbound event. Returns the frame published, if any.
    pub async fn dispatch(
        &self,
        destination: Destination,
        body: &[u8],
    ) -> Result<Option<Frame>, RouterError> {
        let id = destination.file_id;
        match destination.kind {
            EventKind::Open => self.open(id).await.map(Some),
            EventKind::Edit => self.edit(id, body).await.map(Some),
            EventKind::Close => self.close(id).await.map(|_| None),
        }
    }

    /// Handle an open: publish the current content, or "" if the gate is busy.
    pub async fn open(&self, id: FileId) -> Result<Frame, RouterError> {
        log::info!("open → {id}");

        let content = loop {
            let store = &self.store;
            let session = self
                .registry
                .get_or_create(id, || async move { store.load_content(id).await })
                .await?;

            let Some(gate) = session.try_acquire() else {
                log::warn!("Gate busy for file {id}, serving empty content");
                break String::new();
            };
            match gate.read_content().await {
                Some(content) => break content,
                // Flushed before we got the gate; load a fresh one.
                None => {
                    log::debug!("Open for file {id} hit a retired session, reloading");
                    self.registry.remove_session(&session).await;
                }
            }
        };

        let frame = OpenResponse::new(content).encode()?;
        self.topics.publish(id, frame.clone()).await;
        Ok(frame)
    }

    /// Handle an edit: store its content and republish the raw bytes.
    pub async fn edit(&self, id: FileId, raw: &[u8]) -> Result<Frame, RouterError> {
        let content = EditFrame::parse(raw)?.into_content();

        loop {
            let session = self.registry.get_or_seed(id, content.clone()).await;
            match session.replace_content(content.clone()).await {
                ReplaceOutcome::Applied => break,
                ReplaceOutcome::Retired => {
                    log::debug!("Edit for file {id} raced a close, retrying on a fresh session");
                    self.registry.remove_session(&session).await;
                }
            }
        }

        let frame = Frame::from(raw);
        let receivers = self.topics.publish(id, frame.clone()).await;
        log::debug!("edit → {id} ({} bytes, {receivers} receivers)", raw.len());
        Ok(frame)
    }

    /// Handle a close: flush and evict if the gate is free.
    pub async fn close(&self, id: FileId) -> Result<CloseOutcome, RouterError> {
        log::info!("close → {id}");

        let Some(session) = self.registry.get(id).await else {
            return Ok(CloseOutcome::Absent);
        };
        let Some(gate) = session.try_acquire() else {
            log::warn!("Gate busy for file {id}, leaving session open");
            return Ok(CloseOutcome::Contended);
        };

        let (registry, store, current) = (&self.registry, &self.store, &session);
        let flushed = gate
            .retire_with(|content| async move {
                store.save_content(id, &content).await?;
                registry.remove_session(current).await;
                Ok::<_, PersistenceError>(())
            })
            .await
            .inspect_err(|e| log::error!("Failed to persist file {id}: {e}"))?;

        if flushed {
            log::info!("Persisted and closed file {id}");
            self.topics.prune(id).await;
            Ok(CloseOutcome::Flushed)
        } else {
            Ok(CloseOutcome::Absent)
        }
    }

    /// Close every live session. Failures are collected, not raised.
    pub async fn shutdown(&self) -> ShutdownReport {
        let sessions = self.registry.list_all().await;
        log::info!("Draining {} open sessions", sessions.len());

        let mut report = ShutdownReport::default();
        for session in sessions {
            let id = session.id();
            match self.close(id).await {
                Ok(CloseOutcome::Flushed) => report.flushed.push(id),
                Ok(CloseOutcome::Absent) => {}
                Ok(CloseOutcome::Contended) => report.contended.push(id),
                Err(RouterError::Persistence(e)) => report.failed.push((id, e)),
                Err(RouterError::Frame(e)) => {
                    log::error!("Unexpected frame error closing file {id}: {e}");
                }
            }
        }
        report
    }
}
