use crate::ActionId;
use serde::{Deserialize, Serialize};
use slotmap::SlotMap;
use smallvec::SmallVec;

/// An item which is triggered once the train has travelled a certain distance.
pub trait Scheduled {
    /// The distance travelled at which the item becomes ready, in m.
    fn trigger_distance(&self) -> f64;
}

/// A train's queue of scheduled actions, ordered by trigger distance.
///
/// Items are stored in an arena so that their IDs remain valid while
/// other items are inserted and removed. At most one item is active at a time;
/// the active item is held outside of the pending order.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ActionQueue<T> {
    /// Storage for all pending items and the active item.
    items: SlotMap<ActionId, T>,
    /// The pending items, in ascending order of trigger distance.
    pending: SmallVec<[ActionId; 8]>,
    /// The currently active item.
    active: Option<ActionId>,
}

impl<T> Default for ActionQueue<T> {
    fn default() -> Self {
        Self {
            items: SlotMap::with_key(),
            pending: SmallVec::new(),
            active: None,
        }
    }
}

impl<T: Scheduled> ActionQueue<T> {
    /// Creates an empty queue.
    pub fn new() -> Self {
        Default::default()
    }

    /// Inserts a pending item. Items with equal trigger distances keep their insertion order.
    pub fn insert(&mut self, item: T) -> ActionId {
        let trigger = item.trigger_distance();
        let id = self.items.insert(item);
        let idx = self
            .pending
            .iter()
            .position(|id| self.items[*id].trigger_distance() > trigger)
            .unwrap_or(self.pending.len());
        self.pending.insert(idx, id);
        id
    }

    /// Removes and returns all pending items which are ready at the given distance travelled,
    /// in order of trigger distance.
    pub fn pop_ready(&mut self, distance: f64) -> Vec<T> {
        let count = self
            .pending
            .iter()
            .take_while(|id| self.items[**id].trigger_distance() <= distance)
            .count();
        let items = &mut self.items;
        self.pending
            .drain(..count)
            .filter_map(|id| items.remove(id))
            .collect()
    }

    /// Re-sorts a pending item after its trigger distance has been changed.
    pub fn reschedule(&mut self, id: ActionId) {
        if let Some(idx) = self.pending.iter().position(|p| *p == id) {
            self.pending.remove(idx);
            let trigger = self.items[id].trigger_distance();
            let idx = self
                .pending
                .iter()
                .position(|id| self.items[*id].trigger_distance() > trigger)
                .unwrap_or(self.pending.len());
            self.pending.insert(idx, id);
        }
    }
}

impl<T> ActionQueue<T> {
    /// Removes an item, whether pending or active. Unknown IDs are ignored.
    pub fn remove(&mut self, id: ActionId) -> Option<T> {
        if let Some(idx) = self.pending.iter().position(|p| *p == id) {
            self.pending.remove(idx);
        }
        if self.active == Some(id) {
            self.active = None;
        }
        self.items.remove(id)
    }

    /// Makes `item` the active item, discarding the previously active item.
    pub fn set_active(&mut self, item: T) -> ActionId {
        if let Some(prev) = self.active.take() {
            self.items.remove(prev);
        }
        let id = self.items.insert(item);
        self.active = Some(id);
        id
    }

    /// The active item.
    pub fn active(&self) -> Option<&T> {
        self.active.and_then(|id| self.items.get(id))
    }

    /// A mutable reference to the active item.
    pub fn active_mut(&mut self) -> Option<&mut T> {
        self.active.and_then(|id| self.items.get_mut(id))
    }

    /// The ID of the active item.
    pub fn active_id(&self) -> Option<ActionId> {
        self.active
    }

    /// Removes and returns the active item.
    pub fn take_active(&mut self) -> Option<T> {
        self.active.take().and_then(|id| self.items.remove(id))
    }

    /// Clears all pending items, and the active item unless `keep_immediate` is set.
    pub fn clear_pending(&mut self, keep_immediate: bool) {
        for id in self.pending.drain(..) {
            self.items.remove(id);
        }
        if !keep_immediate {
            if let Some(id) = self.active.take() {
                self.items.remove(id);
            }
        }
    }

    /// Gets an item by ID.
    pub fn get(&self, id: ActionId) -> Option<&T> {
        self.items.get(id)
    }

    /// Gets a mutable reference to an item by ID.
    /// Callers changing the trigger distance must call [ActionQueue::reschedule].
    pub fn get_mut(&mut self, id: ActionId) -> Option<&mut T> {
        self.items.get_mut(id)
    }

    /// The pending item with the lowest trigger distance.
    pub fn peek(&self) -> Option<&T> {
        self.pending.first().map(|id| &self.items[*id])
    }

    /// Iterates over the pending items in order.
    pub fn iter(&self) -> impl Iterator<Item = (ActionId, &T)> + '_ {
        self.pending.iter().map(move |id| (*id, &self.items[*id]))
    }

    /// Iterates over the pending items and the active item.
    pub fn iter_all(&self) -> impl Iterator<Item = (ActionId, &T)> + '_ {
        self.iter().chain(
            self.active
                .and_then(|id| self.items.get(id).map(|item| (id, item))),
        )
    }

    /// Removes every pending item for which `f` returns `false`.
    pub fn retain_pending(&mut self, mut f: impl FnMut(&T) -> bool) {
        let items = &mut self.items;
        self.pending.retain(|id| {
            let keep = f(&items[*id]);
            if !keep {
                items.remove(*id);
            }
            keep
        });
    }

    /// The number of pending items.
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    /// Whether there are no pending items.
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Checks the internal consistency of a deserialized queue.
    pub(crate) fn is_consistent(&self) -> Result<(), ActionId> {
        let mut listed = self.pending.iter().chain(&self.active);
        if let Some(id) = listed.find(|id| !self.items.contains_key(**id)) {
            return Err(*id);
        }
        match self
            .items
            .keys()
            .find(|id| !self.pending.contains(id) && self.active != Some(*id))
        {
            Some(id) => Err(id),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::action::{ActionItem, ActionKind};
    use itertools::Itertools;

    fn item(trigger: f64) -> ActionItem {
        ActionItem::new(ActionKind::SpeedLimit, trigger, trigger + 100.0, 10.0, 0.0)
    }

    #[test]
    fn pop_ready_in_order() {
        let mut queue = ActionQueue::new();
        for trigger in [50.0, 10.0, 30.0, 30.0, 80.0, 0.0] {
            queue.insert(item(trigger));
        }

        let ready = queue.pop_ready(30.0);
        let triggers = ready.iter().map(|i| i.trigger_distance).collect::<Vec<_>>();
        assert_eq!(triggers, vec![0.0, 10.0, 30.0, 30.0]);
        assert_eq!(queue.len(), 2);

        assert!(queue.pop_ready(49.9).is_empty());
        assert_eq!(queue.pop_ready(1000.0).len(), 2);
        assert!(queue.is_empty());
    }

    #[test]
    fn pop_ready_never_early() {
        let mut queue = ActionQueue::new();
        let triggers = [12.0, 3.0, 44.0, 7.5, 19.0, 3.0, 61.0, 0.5, 28.0, 33.3];
        for trigger in triggers {
            queue.insert(item(trigger));
        }
        let mut popped = vec![];
        for d in [0.0, 5.0, 20.0, 40.0, 100.0] {
            let ready = queue.pop_ready(d);
            assert!(ready.iter().all(|i| i.trigger_distance <= d));
            popped.extend(ready.into_iter().map(|i| i.trigger_distance));
        }
        assert_eq!(popped.len(), triggers.len());
        assert!(popped.iter().tuple_windows().all(|(a, b)| a <= b));
    }

    #[test]
    fn remove_by_identity() {
        let mut queue = ActionQueue::new();
        let a = queue.insert(item(10.0));
        let b = queue.insert(item(20.0));
        assert!(queue.remove(a).is_some());
        assert!(queue.remove(a).is_none());
        assert_eq!(queue.iter().map(|(id, _)| id).collect::<Vec<_>>(), vec![b]);
    }

    #[test]
    fn clear_pending_keeps_active() {
        let mut queue = ActionQueue::new();
        queue.insert(item(10.0));
        queue.set_active(item(5.0));

        queue.clear_pending(true);
        assert!(queue.is_empty());
        assert!(queue.active().is_some());

        queue.insert(item(10.0));
        queue.clear_pending(false);
        assert!(queue.is_empty());
        assert!(queue.active().is_none());
    }

    #[test]
    fn set_active_discards_previous() {
        let mut queue = ActionQueue::new();
        let first = queue.set_active(item(5.0));
        let second = queue.set_active(item(6.0));
        assert!(queue.get(first).is_none());
        assert_eq!(queue.active_id(), Some(second));
        assert_eq!(queue.iter_all().count(), 1);
        assert_eq!(queue.take_active().unwrap().trigger_distance, 6.0);
        assert!(queue.active().is_none());
    }

    #[test]
    fn reschedule_moves_item() {
        let mut queue = ActionQueue::new();
        let a = queue.insert(item(10.0));
        queue.insert(item(20.0));
        queue.get_mut(a).unwrap().trigger_distance = 30.0;
        queue.reschedule(a);
        assert_eq!(queue.peek().unwrap().trigger_distance, 20.0);
        assert!(queue.is_consistent().is_ok());
    }
}
