use std::{
    collections::HashMap,
    future::Future,
    pin::Pin,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Mutex,
    },
};

use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PersistenceError {
    #[error("diagram store unavailable: {0}")]
    Unavailable(String),
}

pub type PersistFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, PersistenceError>> + Send + 'a>>;

/// Durable home of diagram documents.
///
/// `initial_state` returns `None` for a diagram that has never been
/// persisted; the session then starts from an empty document.
pub trait DiagramService: Send + Sync {
    fn initial_state<'a>(&'a self, diagram_id: Uuid) -> PersistFuture<'a, Option<Vec<u8>>>;
    fn persist<'a>(&'a self, diagram_id: Uuid, state: &'a [u8]) -> PersistFuture<'a, ()>;
}

/// In-process diagram store with an outage switch.
#[derive(Debug)]
pub struct MemoryDiagramStore {
    snapshots: Mutex<HashMap<Uuid, Vec<u8>>>,
    available: AtomicBool,
    persist_calls: AtomicUsize,
}

impl Default for MemoryDiagramStore {
    fn default() -> Self {
        Self {
            snapshots: Mutex::new(HashMap::new()),
            available: AtomicBool::new(true),
            persist_calls: AtomicUsize::new(0),
        }
    }
}

impl MemoryDiagramStore {
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    pub fn seed(&self, diagram_id: Uuid, state: Vec<u8>) {
        self.snapshots.lock().expect("diagram store lock poisoned").insert(diagram_id, state);
    }

    pub fn snapshot(&self, diagram_id: Uuid) -> Option<Vec<u8>> {
        self.snapshots.lock().expect("diagram store lock poisoned").get(&diagram_id).cloned()
    }

    /// Persist attempts, successful or not.
    pub fn persist_calls(&self) -> usize {
        self.persist_calls.load(Ordering::SeqCst)
    }

    fn ensure_available(&self) -> Result<(), PersistenceError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(PersistenceError::Unavailable("memory store switched off".to_string()))
        }
    }
}

impl DiagramService for MemoryDiagramStore {
    fn initial_state<'a>(&'a self, diagram_id: Uuid) -> PersistFuture<'a, Option<Vec<u8>>> {
        Box::pin(async move {
            self.ensure_available()?;
            Ok(self.snapshot(diagram_id))
        })
    }

    fn persist<'a>(&'a self, diagram_id: Uuid, state: &'a [u8]) -> PersistFuture<'a, ()> {
        Box::pin(async move {
            self.persist_calls.fetch_add(1, Ordering::SeqCst);
            self.ensure_available()?;
            self.seed(diagram_id, state.to_vec());
            Ok(())
        })
    }
}
