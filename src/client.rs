//! Subscriber side: durable resume-token storage and a reconnecting client.

use crate::cursor::ChangeStreamCursor;
use crate::error::ChangeStreamError;
use crate::event::ChangeEvent;
use crate::oplog::CancellationSignal;
use crate::session::{Session, SubscribeRequest};
use crate::token::EncodedResumeToken;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use thiserror::Error;

/// Durable home for the newest token a subscriber has processed.
pub trait ResumeTokenStore {
    fn load(&self) -> Result<Option<EncodedResumeToken>, TokenStoreError>;
    fn save(&mut self, token: &EncodedResumeToken) -> Result<(), TokenStoreError>;
}

/// Errors surfaced while persisting resume tokens.
#[derive(Debug, Error)]
pub enum TokenStoreError {
    #[error("token store io error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("token store at {path:?} holds invalid JSON: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to serialize resume token: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// In-process store; clones share the saved token.
#[derive(Debug, Clone, Default)]
pub struct MemoryTokenStore {
    token: Arc<Mutex<Option<EncodedResumeToken>>>,
}

impl MemoryTokenStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current(&self) -> Option<EncodedResumeToken> {
        self.token.lock().unwrap().clone()
    }
}

impl ResumeTokenStore for MemoryTokenStore {
    fn load(&self) -> Result<Option<EncodedResumeToken>, TokenStoreError> {
        Ok(self.current())
    }

    fn save(&mut self, token: &EncodedResumeToken) -> Result<(), TokenStoreError> {
        *self.token.lock().unwrap() = Some(token.clone());
        Ok(())
    }
}

/// JSON file store. Saves go through a sibling `.tmp` file renamed into place.
#[derive(Debug, Clone)]
pub struct FileTokenStore {
    path: PathBuf,
}

impl FileTokenStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn io_error(&self, source: std::io::Error) -> TokenStoreError {
        TokenStoreError::Io {
            path: self.path.clone(),
            source,
        }
    }
}

impl ResumeTokenStore for FileTokenStore {
    fn load(&self) -> Result<Option<EncodedResumeToken>, TokenStoreError> {
        let raw = match std::fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(self.io_error(err)),
        };
        serde_json::from_str(&raw)
            .map(Some)
            .map_err(|source| TokenStoreError::Parse {
                path: self.path.clone(),
                source,
            })
    }

    fn save(&mut self, token: &EncodedResumeToken) -> Result<(), TokenStoreError> {
        let body = serde_json::to_vec(token)?;
        let mut staging = self.path.clone().into_os_string();
        staging.push(".tmp");
        let staging = PathBuf::from(staging);
        std::fs::write(&staging, body).map_err(|err| self.io_error(err))?;
        std::fs::rename(&staging, &self.path).map_err(|err| self.io_error(err))
    }
}

/// Client-side failures.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error(transparent)]
    Stream(#[from] ChangeStreamError),
    #[error(transparent)]
    Store(#[from] TokenStoreError),
    #[error("client is not connected")]
    NotConnected,
}

/// Counters for the client's lifetime, across reconnects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ClientTelemetry {
    pub connects_total: u64,
    pub resumes_total: u64,
    pub batches_total: u64,
    pub events_total: u64,
    pub tokens_saved_total: u64,
}

/// Subscriber that checkpoints after every batch and resumes on reconnect.
pub struct ChangeStreamClient<S: ResumeTokenStore> {
    store: S,
    namespace: String,
    batch_size: Option<usize>,
    max_await_time_ms: Option<u64>,
    cursor: Option<ChangeStreamCursor>,
    telemetry: ClientTelemetry,
}

impl<S: ResumeTokenStore> ChangeStreamClient<S> {
    pub fn new(store: S, namespace: impl Into<String>) -> Self {
        Self {
            store,
            namespace: namespace.into(),
            batch_size: None,
            max_await_time_ms: None,
            cursor: None,
            telemetry: ClientTelemetry::default(),
        }
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = Some(batch_size);
        self
    }

    pub fn with_max_await_time_ms(mut self, max_await_time_ms: u64) -> Self {
        self.max_await_time_ms = Some(max_await_time_ms);
        self
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn telemetry(&self) -> ClientTelemetry {
        self.telemetry
    }

    pub fn is_connected(&self) -> bool {
        self.cursor.is_some()
    }

    pub fn cursor(&self) -> Option<&ChangeStreamCursor> {
        self.cursor.as_ref()
    }

    /// Opens a stream on `session`, resuming after the stored token if any.
    pub fn connect(&mut self, session: &Session) -> Result<(), ClientError> {
        self.disconnect();
        let mut request = SubscribeRequest::new(self.namespace.clone());
        request.batch_size = self.batch_size;
        request.max_await_time_ms = self.max_await_time_ms;
        let stored = self.store.load()?;
        let resuming = stored.is_some();
        if let Some(token) = stored {
            request = request.resume_after(token);
        }
        let cursor = session.subscribe(&request)?;
        self.telemetry.connects_total += 1;
        if resuming {
            self.telemetry.resumes_total += 1;
        }
        self.cursor = Some(cursor);
        Ok(())
    }

    /// Fetches one batch and checkpoints its resume point before returning.
    ///
    /// The checkpoint is the post-batch token when the server sent one, else
    /// the id of the last event in the batch.
    pub fn poll(&mut self, cancel: &CancellationSignal) -> Result<Vec<ChangeEvent>, ClientError> {
        let cursor = self.cursor.as_mut().ok_or(ClientError::NotConnected)?;
        let batch = cursor.next_batch(cancel)?;
        let checkpoint = batch
            .post_batch_resume_token
            .as_ref()
            .or_else(|| batch.events.last().map(|event| &event.id))
            .map(|token| token.to_encoded());
        if let Some(token) = checkpoint {
            self.store.save(&token)?;
            self.telemetry.tokens_saved_total += 1;
        }
        self.telemetry.batches_total += 1;
        self.telemetry.events_total += batch.events.len() as u64;
        Ok(batch.events)
    }

    /// Closes the current cursor, keeping the stored token.
    pub fn disconnect(&mut self) {
        if let Some(mut cursor) = self.cursor.take() {
            cursor.close();
        }
    }
}
