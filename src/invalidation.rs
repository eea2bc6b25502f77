use std::collections::{BTreeSet, HashMap, HashSet};

use tallydb_core::Table;

pub type SubscriptionId = u64;

/// Table-keyed fan-out index from written tables to the subscriptions that
/// read them.
#[derive(Debug, Default)]
pub struct InvalidationTracker {
    dependencies: HashMap<SubscriptionId, BTreeSet<Table>>,
    readers: HashMap<Table, HashSet<SubscriptionId>>,
}

impl InvalidationTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers (or replaces) the dependency set of `id`.
    pub fn register(&mut self, id: SubscriptionId, tables: impl IntoIterator<Item = Table>) {
        self.unregister(id);
        let tables: BTreeSet<Table> = tables.into_iter().collect();
        for table in &tables {
            self.readers.entry(*table).or_default().insert(id);
        }
        self.dependencies.insert(id, tables);
    }

    /// Returns false if `id` was not registered.
    pub fn unregister(&mut self, id: SubscriptionId) -> bool {
        let Some(tables) = self.dependencies.remove(&id) else {
            return false;
        };
        for table in tables {
            if let Some(ids) = self.readers.get_mut(&table) {
                ids.remove(&id);
                if ids.is_empty() {
                    self.readers.remove(&table);
                }
            }
        }
        true
    }

    pub fn notify_write(&self, table: Table) -> HashSet<SubscriptionId> {
        self.readers.get(&table).cloned().unwrap_or_default()
    }

    /// Union of the readers of every table in `tables`.
    pub fn notify_writes<'a>(&self, tables: impl IntoIterator<Item = &'a Table>) -> HashSet<SubscriptionId> {
        let mut affected = HashSet::new();
        for table in tables {
            if let Some(ids) = self.readers.get(table) {
                affected.extend(ids.iter().copied());
            }
        }
        affected
    }

    pub fn dependencies(&self, id: SubscriptionId) -> Option<&BTreeSet<Table>> {
        self.dependencies.get(&id)
    }

    pub fn len(&self) -> usize {
        self.dependencies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.dependencies.is_empty()
    }
}
