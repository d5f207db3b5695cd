#![forbid(unsafe_code)]

//! Global storage: at most one resource per `(address, struct tag)`.
//!
//! Every slot sits behind its own mutex and carries the version stamp of the
//! commit that last wrote it. Stamps come from one storage-wide clock, so a
//! slot that is emptied, pruned and later recreated never repeats a stamp.
//! An absent slot reads as version 0. Executions never touch committed
//! state directly; they work in a [`StorageTransaction`] that records the
//! version of every slot it looked at and publishes its writes only if none
//! of those slots changed in the meantime.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::{Mutex, RwLock, RwLockWriteGuard};
use serde::{Deserialize, Serialize};
use slate_ast::AccountAddress;
use slate_core::StructTag;

use crate::error::RuntimeError;
use crate::value::Value;

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SlotKey {
    pub address: AccountAddress,
    pub tag: StructTag,
}

impl SlotKey {
    pub fn new(address: AccountAddress, tag: StructTag) -> Self {
        Self { address, tag }
    }
}

impl fmt::Display for SlotKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.tag, self.address)
    }
}

#[derive(Debug, Default)]
struct Slot {
    version: u64,
    value: Option<Value>,
}

/// One committed resource, as listed by [`GlobalStorage::snapshot`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredResource {
    pub address: AccountAddress,
    pub value: Value,
}

/// Thread-safe committed state. Share it with `Arc` across executions.
#[derive(Debug, Default)]
pub struct GlobalStorage {
    /// Holds only slots that are occupied or being written. Slot mutexes are
    /// taken only while this map is locked, so pruning never strands a
    /// handle another commit is about to write through.
    slots: RwLock<HashMap<SlotKey, Arc<Mutex<Slot>>>>,
    clock: AtomicU64,
}

impl GlobalStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn new_shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Rebuild storage from a snapshot.
    pub fn from_snapshot(resources: Vec<StoredResource>) -> Result<Self, RuntimeError> {
        let storage = Self::new();
        for r in resources {
            storage.seed(r.address, r.value)?;
        }
        Ok(storage)
    }

    /// Publish `value` at `address` outside any execution, as a host
    /// pre-populating state would.
    pub fn seed(&self, address: AccountAddress, value: Value) -> Result<(), RuntimeError> {
        let Value::Struct(s) = &value else {
            return Err(RuntimeError::invalid_argument(format!(
                "only struct values can be stored, got a {}",
                value.kind()
            )));
        };
        let key = SlotKey::new(address, s.tag.clone());
        let mut slots = self.slots.write();
        if slots.get(&key).is_some_and(|slot| slot.lock().value.is_some()) {
            return Err(RuntimeError::ResourceAlreadyExists {
                address,
                resource: key.tag.to_string(),
            });
        }
        let version = self.tick();
        slots.insert(
            key,
            Arc::new(Mutex::new(Slot {
                version,
                value: Some(value),
            })),
        );
        Ok(())
    }

    pub fn exists(&self, key: &SlotKey) -> bool {
        self.read(key).1.is_some()
    }

    /// Committed value of a slot.
    pub fn get(&self, key: &SlotKey) -> Option<Value> {
        self.read(key).1
    }

    /// Number of occupied slots.
    pub fn len(&self) -> usize {
        self.slots
            .read()
            .values()
            .filter(|slot| slot.lock().value.is_some())
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Every committed resource, ordered by address then type.
    pub fn snapshot(&self) -> Vec<StoredResource> {
        let slots = self.slots.read();
        let mut occupied: Vec<(&SlotKey, Value)> = slots
            .iter()
            .filter_map(|(key, slot)| Some((key, slot.lock().value.clone()?)))
            .collect();
        occupied.sort_by(|a, b| a.0.cmp(b.0));
        occupied
            .into_iter()
            .map(|(key, value)| StoredResource {
                address: key.address,
                value,
            })
            .collect()
    }

    pub fn begin(&self) -> StorageTransaction<'_> {
        StorageTransaction {
            storage: self,
            entries: BTreeMap::new(),
        }
    }

    fn read(&self, key: &SlotKey) -> (u64, Option<Value>) {
        let slots = self.slots.read();
        match slots.get(key) {
            Some(slot) => {
                let slot = slot.lock();
                (slot.version, slot.value.clone())
            }
            None => (0, None),
        }
    }

    fn tick(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Drop the slots among `keys` that ended up empty.
    fn prune(&self, keys: &[SlotKey]) {
        let mut slots = self.slots.write();
        for key in keys {
            if slots.get(key).is_some_and(|slot| slot.lock().value.is_none()) {
                slots.remove(key);
            }
        }
    }
}

#[derive(Debug)]
struct Entry {
    /// Committed version observed when the slot was first touched.
    version: u64,
    value: Option<Value>,
    dirty: bool,
}

/// Buffered view of storage for one top-level execution.
///
/// Dropping a transaction without [`commit`](Self::commit) discards every
/// write.
#[derive(Debug)]
pub struct StorageTransaction<'s> {
    storage: &'s GlobalStorage,
    entries: BTreeMap<SlotKey, Entry>,
}

impl<'s> StorageTransaction<'s> {
    fn entry(&mut self, key: &SlotKey) -> &mut Entry {
        let storage = self.storage;
        self.entries.entry(key.clone()).or_insert_with(|| {
            let (version, value) = storage.read(key);
            Entry {
                version,
                value,
                dirty: false,
            }
        })
    }

    pub fn exists(&mut self, key: &SlotKey) -> bool {
        self.entry(key).value.is_some()
    }

    pub fn move_to(&mut self, key: SlotKey, value: Value) -> Result<(), RuntimeError> {
        let entry = self.entry(&key);
        if entry.value.is_some() {
            return Err(RuntimeError::ResourceAlreadyExists {
                address: key.address,
                resource: key.tag.to_string(),
            });
        }
        entry.value = Some(value);
        entry.dirty = true;
        Ok(())
    }

    pub fn move_from(&mut self, key: &SlotKey) -> Result<Value, RuntimeError> {
        let entry = self.entry(key);
        let value = entry.value.take().ok_or_else(|| missing(key))?;
        entry.dirty = true;
        Ok(value)
    }

    pub fn borrow(&mut self, key: &SlotKey) -> Result<&Value, RuntimeError> {
        self.entry(key).value.as_ref().ok_or_else(|| missing(key))
    }

    pub fn borrow_mut(&mut self, key: &SlotKey) -> Result<&mut Value, RuntimeError> {
        self.value_mut(key, true)
    }

    /// Place of the resource at `key`; only `write` access marks the slot
    /// as modified.
    pub(crate) fn value_mut(&mut self, key: &SlotKey, write: bool) -> Result<&mut Value, RuntimeError> {
        let entry = self.entry(key);
        match entry.value.as_mut() {
            Some(value) => {
                entry.dirty |= write;
                Ok(value)
            }
            None => Err(missing(key)),
        }
    }

    pub fn has_writes(&self) -> bool {
        self.entries.values().any(|e| e.dirty)
    }

    /// Publish every write, or none of them.
    ///
    /// Slots are written only through handles found in the map while it is
    /// locked, and touched slots are locked in key order, so concurrent
    /// commits cannot deadlock. Slots this transaction only read are checked
    /// without creating them. Returns the number of slots written.
    pub fn commit(self) -> Result<usize, RuntimeError> {
        let StorageTransaction { storage, entries } = self;
        let slots = if entries.values().any(|e| e.dirty) {
            let mut slots = storage.slots.write();
            for (key, entry) in &entries {
                if entry.dirty {
                    slots.entry(key.clone()).or_default();
                }
            }
            RwLockWriteGuard::downgrade(slots)
        } else {
            storage.slots.read()
        };
        let mut guards: Vec<_> = entries.keys().map(|k| slots.get(k).map(|slot| slot.lock())).collect();

        let stale = entries.iter().zip(&guards).find_map(|((key, entry), guard)| {
            let now = guard.as_ref().map_or(0, |slot| slot.version);
            (now != entry.version).then(|| {
                tracing::debug!(slot = %key, seen = entry.version, now, "stale read");
                RuntimeError::Conflict {
                    address: key.address,
                    resource: key.tag.to_string(),
                }
            })
        });
        if let Some(conflict) = stale {
            drop(guards);
            drop(slots);
            let reserved: Vec<SlotKey> = entries
                .into_iter()
                .filter(|(_, entry)| entry.dirty)
                .map(|(key, _)| key)
                .collect();
            storage.prune(&reserved);
            return Err(conflict);
        }

        let mut written = 0;
        let mut emptied = Vec::new();
        for ((key, entry), guard) in entries.into_iter().zip(guards.iter_mut()) {
            if !entry.dirty {
                continue;
            }
            let Some(slot) = guard.as_mut() else {
                return Err(RuntimeError::invariant(format!("no slot reserved for {key}")));
            };
            tracing::trace!(slot = %key, present = entry.value.is_some(), "write");
            if entry.value.is_none() {
                emptied.push(key);
            }
            slot.value = entry.value;
            slot.version = storage.tick();
            written += 1;
        }
        drop(guards);
        drop(slots);

        if !emptied.is_empty() {
            storage.prune(&emptied);
        }
        Ok(written)
    }
}

fn missing(key: &SlotKey) -> RuntimeError {
    RuntimeError::MissingResource {
        address: key.address,
        resource: key.tag.to_string(),
    }
}
