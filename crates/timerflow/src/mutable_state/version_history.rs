//! Version histories: branches of `(event id, version)` ranges.
//!
//! A branch is a compressed list of items where each item marks the last event
//! id written under a failover version. Item `i` covers the event ids
//! `(items[i-1].event_id, items[i].event_id]`. Conflicts between clusters are
//! resolved by comparing versions, never timestamps: the branch whose last item
//! carries the higher version becomes current.

use nonempty::NonEmpty;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Last event id written under `version`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VersionHistoryItem {
    pub event_id: i64,
    pub version: i64,
}

impl VersionHistoryItem {
    pub const fn new(event_id: i64, version: i64) -> Self {
        Self { event_id, version }
    }
}

/// One branch of history.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionHistory {
    items: Vec<VersionHistoryItem>,
}

impl VersionHistory {
    pub fn new(items: Vec<VersionHistoryItem>) -> Self {
        Self { items }
    }

    pub fn items(&self) -> &[VersionHistoryItem] {
        &self.items
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Record that `item.event_id` was written under `item.version`.
    ///
    /// Extends the last item when the version is unchanged, appends otherwise.
    /// Versions and event ids must both move forward.
    pub fn add_or_update_item(&mut self, item: VersionHistoryItem) -> Result<()> {
        let Some(last) = self.items.last_mut() else {
            self.items.push(item);
            return Ok(());
        };
        if item.version < last.version {
            return Err(Error::internal(format!(
                "cannot add version {} after version {}",
                item.version, last.version
            )));
        }
        if item.event_id <= last.event_id {
            return Err(Error::internal(format!(
                "cannot add event id {} after event id {}",
                item.event_id, last.event_id
            )));
        }
        if item.version == last.version {
            last.event_id = item.event_id;
        } else {
            self.items.push(item);
        }
        Ok(())
    }

    pub fn last_item(&self) -> Result<VersionHistoryItem> {
        self.items
            .last()
            .copied()
            .ok_or_else(|| Error::internal("version history is empty"))
    }

    /// Whether the event `item.event_id` exists on this branch with `item.version`.
    pub fn contains_item(&self, item: VersionHistoryItem) -> bool {
        let mut previous_event_id = 0;
        for current in &self.items {
            if item.version == current.version
                && previous_event_id < item.event_id
                && item.event_id <= current.event_id
            {
                return true;
            }
            previous_event_id = current.event_id;
        }
        false
    }

    /// Version under which `event_id` was written.
    pub fn event_version(&self, event_id: i64) -> Result<i64> {
        let last = self.last_item()?;
        if event_id < 1 || event_id > last.event_id {
            return Err(Error::internal(format!(
                "event id {event_id} is outside version history (last {})",
                last.event_id
            )));
        }
        self.items
            .iter()
            .find(|current| event_id <= current.event_id)
            .map(|current| current.version)
            .ok_or_else(|| Error::internal("version history is malformed"))
    }

    /// Lowest common ancestor item with `other`.
    pub fn find_lca_item(&self, other: &VersionHistory) -> Result<VersionHistoryItem> {
        let mut a = self.items.len();
        let mut b = other.items.len();
        while a > 0 && b > 0 {
            let a_item = self.items[a - 1];
            let b_item = other.items[b - 1];
            if a_item.version == b_item.version {
                return Ok(if a_item.event_id > b_item.event_id {
                    b_item
                } else {
                    a_item
                });
            }
            if a_item.version > b_item.version {
                a -= 1;
            } else {
                b -= 1;
            }
        }
        Err(Error::internal(
            "version history is malformed: no joint point found",
        ))
    }

    /// Whether new events can be appended directly after `item`.
    pub fn is_lca_appendable(&self, item: VersionHistoryItem) -> bool {
        self.items.last() == Some(&item)
    }

    /// Copy of this branch truncated at `item`, the start of a fork.
    pub fn duplicate_until_lca(&self, item: VersionHistoryItem) -> Result<VersionHistory> {
        let mut forked = VersionHistory::default();
        for current in &self.items {
            if current.version == item.version {
                if item.event_id > current.event_id {
                    return Err(Error::internal(format!(
                        "fork point {} is beyond event id {}",
                        item.event_id, current.event_id
                    )));
                }
                forked.add_or_update_item(item)?;
                return Ok(forked);
            }
            forked.add_or_update_item(*current)?;
        }
        Err(Error::internal(format!(
            "fork point version {} not found",
            item.version
        )))
    }
}

/// All branches of one execution, with one marked current.
///
/// # Example
///
/// ```
/// use timerflow::mutable_state::{VersionHistories, VersionHistory, VersionHistoryItem};
///
/// let local = VersionHistory::new(vec![VersionHistoryItem::new(5, 100)]);
/// let mut histories = VersionHistories::new(local);
///
/// let remote = VersionHistory::new(vec![
///     VersionHistoryItem::new(3, 100),
///     VersionHistoryItem::new(7, 200),
/// ]);
/// let (switched, index) = histories.add_version_history(remote).unwrap();
///
/// assert!(switched);
/// assert_eq!(histories.current_index(), index);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionHistories {
    current_index: usize,
    histories: NonEmpty<VersionHistory>,
}

impl VersionHistories {
    pub fn new(history: VersionHistory) -> Self {
        Self {
            current_index: 0,
            histories: NonEmpty::new(history),
        }
    }

    pub fn current_index(&self) -> usize {
        self.current_index
    }

    pub fn len(&self) -> usize {
        self.histories.len()
    }

    pub fn is_empty(&self) -> bool {
        false
    }

    pub fn get(&self, index: usize) -> Result<&VersionHistory> {
        self.histories
            .get(index)
            .ok_or_else(|| Error::internal(format!("version history index {index} out of range")))
    }

    pub fn current(&self) -> &VersionHistory {
        self.histories
            .get(self.current_index)
            .unwrap_or(&self.histories.head)
    }

    pub fn current_mut(&mut self) -> &mut VersionHistory {
        match self.current_index {
            0 => &mut self.histories.head,
            index => match self.histories.tail.get_mut(index - 1) {
                Some(history) => history,
                None => &mut self.histories.head,
            },
        }
    }

    /// Add a branch; it becomes current only when its last version is
    /// strictly higher than the current branch's.
    ///
    /// Returns whether the current branch changed and the new branch's index.
    pub fn add_version_history(&mut self, history: VersionHistory) -> Result<(bool, usize)> {
        let incoming = history.last_item()?;
        let current = self.current().last_item()?;
        let index = self.histories.len();
        self.histories.push(history);
        if incoming.version > current.version {
            self.current_index = index;
            return Ok((true, index));
        }
        Ok((false, index))
    }

    /// Branch sharing the deepest common ancestor with `incoming`.
    ///
    /// Ties prefer the shorter branch.
    pub fn find_lca_version_history_index_and_item(
        &self,
        incoming: &VersionHistory,
    ) -> Result<(usize, VersionHistoryItem)> {
        let mut best: Option<(usize, VersionHistoryItem, usize)> = None;
        for (index, history) in self.histories.iter().enumerate() {
            let lca = history.find_lca_item(incoming)?;
            let better = match best {
                None => true,
                Some((_, item, len)) => {
                    lca.event_id > item.event_id
                        || (lca.event_id == item.event_id && history.items().len() < len)
                }
            };
            if better {
                best = Some((index, lca, history.items().len()));
            }
        }
        best.map(|(index, item, _)| (index, item))
            .ok_or_else(|| Error::internal("no version history found"))
    }

    /// Index of the first branch containing `item`.
    pub fn find_first_version_history_index_by_item(
        &self,
        item: VersionHistoryItem,
    ) -> Result<usize> {
        self.histories
            .iter()
            .position(|history| history.contains_item(item))
            .ok_or_else(|| {
                Error::internal(format!(
                    "version history item ({}, {}) not found",
                    item.event_id, item.version
                ))
            })
    }
}
