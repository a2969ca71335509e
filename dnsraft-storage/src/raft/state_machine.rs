use dnsraft_common::error::StoreResult;
use dnsraft_common::types::{LogIndex, Term};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

/// Trait for the replicated state machine driven by the consensus engine.
///
/// Entries are fed strictly in log order; implementations track the last
/// applied index so replaying an already-applied entry after a restart is a
/// no-op.
pub trait StateMachine: Send + Sync {
    fn get(&self, key: &str) -> Option<String>;

    /// Applies a committed command at `index`. Returns false if `index` was
    /// already applied.
    fn apply(&self, index: LogIndex, term: Term, command: &Command) -> bool;

    /// Records that a non-command entry (noop, configuration) was applied.
    fn advance(&self, index: LogIndex, term: Term);

    /// Index and term of the last applied entry.
    fn last_applied(&self) -> (LogIndex, Term);

    /// Produces a point-in-time copy of the current state
    fn snapshot(&self) -> StoreResult<StateSnapshot>;

    /// Replaces the state wholesale with a snapshot
    fn restore(&self, snapshot: &StateSnapshot) -> StoreResult<()>;
}

/// Commands replicated through the log
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum Command {
    Set { key: String, value: String },
    Delete { key: String },
}

/// A serialized copy of the map plus the log position it reflects.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StateSnapshot {
    pub last_applied_index: LogIndex,
    pub last_applied_term: Term,
    pub state: Vec<u8>,
}

#[derive(Debug, Default)]
struct KvState {
    data: HashMap<String, String>,
    last_applied_index: LogIndex,
    last_applied_term: Term,
}

/// The in-memory record map.
///
/// Readers take the lock only for the duration of a single lookup, so DNS
/// queries never wait on consensus.
#[derive(Debug, Default)]
pub struct KeyValueStore {
    inner: RwLock<KvState>,
}

impl KeyValueStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.inner.read().data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Sorted copy of the whole map.
    pub fn dump(&self) -> BTreeMap<String, String> {
        self.inner
            .read()
            .data
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }
}

impl StateMachine for KeyValueStore {
    fn get(&self, key: &str) -> Option<String> {
        self.inner.read().data.get(key).cloned()
    }

    fn apply(&self, index: LogIndex, term: Term, command: &Command) -> bool {
        let mut state = self.inner.write();
        if index <= state.last_applied_index {
            return false;
        }
        match command {
            Command::Set { key, value } => {
                state.data.insert(key.clone(), value.clone());
            }
            Command::Delete { key } => {
                state.data.remove(key);
            }
        }
        state.last_applied_index = index;
        state.last_applied_term = term;
        true
    }

    fn advance(&self, index: LogIndex, term: Term) {
        let mut state = self.inner.write();
        if index > state.last_applied_index {
            state.last_applied_index = index;
            state.last_applied_term = term;
        }
    }

    fn last_applied(&self) -> (LogIndex, Term) {
        let state = self.inner.read();
        (state.last_applied_index, state.last_applied_term)
    }

    fn snapshot(&self) -> StoreResult<StateSnapshot> {
        // Copy under the read lock, encode after releasing it.
        let (data, last_applied_index, last_applied_term) = {
            let state = self.inner.read();
            (
                state.data.clone(),
                state.last_applied_index,
                state.last_applied_term,
            )
        };
        Ok(StateSnapshot {
            last_applied_index,
            last_applied_term,
            state: bincode::serialize(&data)?,
        })
    }

    fn restore(&self, snapshot: &StateSnapshot) -> StoreResult<()> {
        let data: HashMap<String, String> = bincode::deserialize(&snapshot.state)?;
        let mut state = self.inner.write();
        state.data = data;
        state.last_applied_index = snapshot.last_applied_index;
        state.last_applied_term = snapshot.last_applied_term;
        Ok(())
    }
}
