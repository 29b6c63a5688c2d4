// Diagram document backed by a yrs Doc.
//
// The relay treats updates as opaque bytes; the only structure it knows
// about is the three root maps a diagram is made of, needed to roll the
// document forward to an older snapshot.

use std::{
    collections::{BTreeMap, BTreeSet},
    panic::{self, AssertUnwindSafe},
};

use thiserror::Error;
use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::types::ToJson;
use yrs::{Any, Doc, Map, MapRef, ReadTxn, StateVector, Transact, Update};

use super::inspect::{inspect_state_vector, inspect_update};

pub const NODES: &str = "nodes";
pub const EDGES: &str = "edges";
pub const META: &str = "meta";
pub const ROOT_MAPS: [&str; 3] = [NODES, EDGES, META];

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DocError {
    #[error("failed to decode CRDT payload: {0}")]
    Decode(String),
    #[error("failed to apply CRDT update: {0}")]
    Apply(String),
}

pub struct DiagramDoc {
    doc: Doc,
}

impl DiagramDoc {
    pub fn new() -> Self {
        Self::from_doc(Doc::new())
    }

    /// Fixed client id, for deterministic tests.
    pub fn with_client_id(client_id: u64) -> Self {
        let options = yrs::Options { client_id, ..Default::default() };
        Self::from_doc(Doc::with_options(options))
    }

    fn from_doc(doc: Doc) -> Self {
        for name in ROOT_MAPS {
            doc.get_or_insert_map(name);
        }
        Self { doc }
    }

    /// Load a document from a full-state update.
    pub fn from_state(state: &[u8]) -> Result<Self, DocError> {
        let doc = Self::new();
        doc.apply_update(state)?;
        Ok(doc)
    }

    /// Merge one update. Payloads are checked before decoding; a panic in
    /// the decoder or in the merge is reported like any other failure.
    pub fn apply_update(&self, update: &[u8]) -> Result<(), DocError> {
        inspect_update(update).map_err(|error| DocError::Decode(error.to_string()))?;
        let update = panic::catch_unwind(AssertUnwindSafe(|| Update::decode_v1(update)))
            .map_err(|_| DocError::Decode("decoder panicked".to_string()))?
            .map_err(|error| DocError::Decode(error.to_string()))?;
        panic::catch_unwind(AssertUnwindSafe(|| self.doc.transact_mut().apply_update(update)))
            .map_err(|_| DocError::Apply("merge panicked".to_string()))?
            .map_err(|error| DocError::Apply(error.to_string()))
    }

    pub fn encode_state(&self) -> Vec<u8> {
        self.doc.transact().encode_state_as_update_v1(&StateVector::default())
    }

    pub fn encode_state_vector(&self) -> Vec<u8> {
        self.doc.transact().state_vector().encode_v1()
    }

    pub fn state_vector(&self) -> StateVector {
        self.doc.transact().state_vector()
    }

    /// Everything the holder of `remote_state_vector` is missing.
    pub fn encode_diff(&self, remote_state_vector: &[u8]) -> Result<Vec<u8>, DocError> {
        inspect_state_vector(remote_state_vector)
            .map_err(|error| DocError::Decode(error.to_string()))?;
        let state_vector = StateVector::decode_v1(remote_state_vector)
            .map_err(|error| DocError::Decode(error.to_string()))?;
        Ok(self.doc.transact().encode_diff_v1(&state_vector))
    }

    fn root(&self, name: &str) -> MapRef {
        self.doc.get_or_insert_map(name)
    }

    pub fn set_entry(&self, root: &str, key: &str, value: impl Into<Any>) {
        let map = self.root(root);
        let mut txn = self.doc.transact_mut();
        map.insert(&mut txn, key, value.into());
    }

    pub fn remove_entry(&self, root: &str, key: &str) {
        let map = self.root(root);
        let mut txn = self.doc.transact_mut();
        map.remove(&mut txn, key);
    }

    pub fn entry(&self, root: &str, key: &str) -> Option<String> {
        let map = self.root(root);
        let txn = self.doc.transact();
        map.get(&txn, key).map(|value| value.to_string(&txn))
    }

    /// Rendered entries of one root map, ordered by key.
    pub fn entries(&self, root: &str) -> BTreeMap<String, String> {
        let map = self.root(root);
        let txn = self.doc.transact();
        map.iter(&txn).map(|(key, value)| (key.to_string(), value.to_string(&txn))).collect()
    }

    fn raw_entries(&self, root: &str) -> BTreeMap<String, Any> {
        let map = self.root(root);
        let txn = self.doc.transact();
        map.iter(&txn).map(|(key, value)| (key.to_string(), value.to_json(&txn))).collect()
    }

    /// Rewrite the root maps to match `snapshot` and return the resulting
    /// delta. History is kept: the restore is an ordinary forward update
    /// that every replica can merge.
    pub fn restore_from(&self, snapshot: &[u8]) -> Result<Vec<u8>, DocError> {
        let target = Self::from_state(snapshot)?;
        let before = self.state_vector();

        for name in ROOT_MAPS {
            let wanted = target.raw_entries(name);
            let current = self.raw_entries(name);
            let stale: BTreeSet<&String> =
                current.keys().filter(|key| !wanted.contains_key(*key)).collect();

            let map = self.root(name);
            let mut txn = self.doc.transact_mut();
            for key in stale {
                map.remove(&mut txn, key);
            }
            for (key, value) in wanted {
                if current.get(&key) != Some(&value) {
                    map.insert(&mut txn, key, value);
                }
            }
        }

        Ok(self.doc.transact().encode_diff_v1(&before))
    }
}

impl Default for DiagramDoc {
    fn default() -> Self {
        Self::new()
    }
}
