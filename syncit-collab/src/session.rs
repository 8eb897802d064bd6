//! In-memory editing session for one open file.
//!
//! ```text
//! ┌──────────────────────────────────────┐
//! │ Session (file_id)                    │
//! │                                      │
//! │  gate   : try-only   ◄── open, close │
//! │  buffer : RwLock     ◄── edit, flush │
//! └──────────────────────────────────────┘
//! ```
//!
//! The gate is never waited on: callers either get it immediately or fall
//! back. Edits do not touch the gate, they serialize on the buffer lock
//! instead. A close holds that same lock for the whole read-then-persist
//! flush and retires the buffer before letting go, so an edit racing a close
//! is either part of the flushed text or sees [`ReplaceOutcome::Retired`].

use std::fmt;
use std::future::Future;
use std::num::ParseIntError;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, MutexGuard, RwLock};

/// Identifier of a collaboratively edited file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FileId(pub i64);

impl fmt::Display for FileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i64> for FileId {
    fn from(id: i64) -> Self {
        Self(id)
    }
}

impl FromStr for FileId {
    type Err = ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse().map(Self)
    }
}

/// Result of [`Session::replace_content`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplaceOutcome {
    /// The buffer now holds the new text.
    Applied,
    /// The session was flushed and evicted; the caller must look it up again.
    Retired,
}

struct Buffer {
    text: String,
    retired: bool,
}

/// One open file: its current text plus the exclusive-access gate.
pub struct Session {
    id: FileId,
    gate: Mutex<()>,
    buffer: RwLock<Buffer>,
}

impl Session {
    pub fn new(id: FileId, initial_content: impl Into<String>) -> Self {
        Self {
            id,
            gate: Mutex::new(()),
            buffer: RwLock::new(Buffer {
                text: initial_content.into(),
                retired: false,
            }),
        }
    }

    pub fn id(&self) -> FileId {
        self.id
    }

    /// Try to take the gate without waiting.
    ///
    /// Returns `None` if someone else holds it. The gate is released when
    /// the returned guard is dropped.
    pub fn try_acquire(&self) -> Option<SessionGate<'_>> {
        let permit = self.gate.try_lock().ok()?;
        Some(SessionGate {
            session: self,
            _permit: permit,
        })
    }

    /// Overwrite the buffer. Last writer wins.
    pub async fn replace_content(&self, text: impl Into<String>) -> ReplaceOutcome {
        let mut buffer = self.buffer.write().await;
        if buffer.retired {
            return ReplaceOutcome::Retired;
        }
        buffer.text = text.into();
        ReplaceOutcome::Applied
    }

    /// Current text, read without the gate.
    pub async fn snapshot(&self) -> String {
        self.buffer.read().await.text.clone()
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session").field("id", &self.id).finish_non_exhaustive()
    }
}

/// Proof of holding a session's gate.
pub struct SessionGate<'a> {
    session: &'a Session,
    _permit: MutexGuard<'a, ()>,
}

impl<'a> SessionGate<'a> {
    pub fn session(&self) -> &'a Session {
        self.session
    }

    /// Read the buffer. `None` once the session has been retired.
    pub async fn read_content(&self) -> Option<String> {
        let buffer = self.session.buffer.read().await;
        (!buffer.retired).then(|| buffer.text.clone())
    }

    /// Hand the current text to `flush` and retire the session if it succeeds.
    ///
    /// The buffer stays write-locked until `flush` resolves, so no edit can
    /// land between the read and the retirement. On error the session is left
    /// live and untouched. Returns `Ok(false)` if it was already retired.
    pub async fn retire_with<F, Fut, E>(&self, flush: F) -> Result<bool, E>
    where
        F: FnOnce(String) -> Fut,
        Fut: Future<Output = Result<(), E>>,
    {
        let mut buffer = self.session.buffer.write().await;
        if buffer.retired {
            return Ok(false);
        }
        flush(buffer.text.clone()).await?;
        buffer.retired = true;
        Ok(true)
    }

    /// Release the gate. Equivalent to dropping the guard.
    pub fn release(self) {}
}
