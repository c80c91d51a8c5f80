//! Radio time scheduler.
//!
//! Every link layer activity that needs the radio reserves a window `[start, end)` on the tick
//! counter. Items live in a fixed arena and are kept ordered by start tick; the head of the
//! order is the next activity to run. Overlapping windows are rejected, the item scheduled
//! first keeps its slot.

use heapless::Vec;

use crate::time::Ticks;

/// Activity a schedule item belongs to.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedKind {
    Advertising,
    Connection(u16),
    Scan,
}

/// A reserved radio window.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedItem {
    pub start: Ticks,
    pub end: Ticks,
    pub kind: SchedKind,
}

impl SchedItem {
    pub const fn new(start: Ticks, end: Ticks, kind: SchedKind) -> Self {
        Self { start, end, kind }
    }

    fn duration(&self) -> u32 {
        self.end.raw().wrapping_sub(self.start.raw())
    }

    fn overlaps(&self, other: &SchedItem) -> bool {
        self.start.is_before(other.end) && other.start.is_before(self.end)
    }
}

/// Handle to an inserted item.
///
/// Handles are invalidated when their item is removed; a stale handle never refers to a
/// different item.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ItemId {
    idx: u8,
    gen: u16,
}

/// Scheduler errors.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedError {
    /// The window overlaps another item.
    Conflict,
    /// The window starts before the current time.
    InPast,
    /// No free slots.
    Full,
    /// The handle does not refer to a scheduled item.
    NotFound,
}

#[derive(Clone, Copy)]
struct Slot {
    item: Option<SchedItem>,
    gen: u16,
}

/// Ordered set of schedule items with capacity `N`.
pub struct Scheduler<const N: usize> {
    slots: [Slot; N],
    free: Vec<u8, N>,
    order: Vec<u8, N>,
    running: Option<u8>,
}

impl<const N: usize> Default for Scheduler<N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const N: usize> Scheduler<N> {
    pub fn new() -> Self {
        assert!(N <= u8::MAX as usize);
        let mut free = Vec::new();
        for idx in (0..N).rev() {
            let _ = free.push(idx as u8);
        }
        Self {
            slots: [Slot { item: None, gen: 0 }; N],
            free,
            order: Vec::new(),
            running: None,
        }
    }

    /// Drop every item.
    pub fn clear(&mut self) {
        *self = Self {
            slots: self.slots.map(|s| Slot {
                item: None,
                gen: s.gen.wrapping_add(1),
            }),
            ..Self::new()
        };
    }

    /// Number of items, running or not.
    pub fn len(&self) -> usize {
        N - self.free.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Look up an item.
    pub fn get(&self, id: ItemId) -> Option<&SchedItem> {
        let slot = self.slots.get(id.idx as usize)?;
        if slot.gen == id.gen {
            slot.item.as_ref()
        } else {
            None
        }
    }

    /// The item currently owning the radio.
    pub fn running(&self) -> Option<ItemId> {
        self.running.map(|idx| self.id(idx))
    }

    /// Start tick of the next item to run.
    pub fn next_start(&self) -> Option<Ticks> {
        self.order
            .first()
            .and_then(|&idx| self.slots[idx as usize].item.map(|i| i.start))
    }

    /// Insert `item`, rejecting it if it overlaps any other item.
    pub fn insert(&mut self, item: SchedItem) -> Result<ItemId, SchedError> {
        if self.conflicts(&item, None) {
            return Err(SchedError::Conflict);
        }
        let idx = self.free.pop().ok_or(SchedError::Full)?;
        self.slots[idx as usize].item = Some(item);
        self.link(idx);
        trace!("[sched] insert {:?} at {}", item.kind, item.start.raw());
        Ok(self.id(idx))
    }

    /// Insert `item` in the first free window at or after its start.
    ///
    /// Returns the handle and the window actually reserved.
    pub fn insert_first_fit(&mut self, mut item: SchedItem) -> Result<(ItemId, SchedItem), SchedError> {
        if self.free.is_empty() {
            return Err(SchedError::Full);
        }
        let duration = item.duration();
        let occupied = self.running.iter().chain(self.order.iter());
        for &idx in occupied {
            if let Some(other) = self.slots[idx as usize].item {
                if item.overlaps(&other) {
                    item.start = other.end;
                    item.end = other.end.add_micros(duration);
                }
            }
        }
        let id = self.insert(item)?;
        Ok((id, item))
    }

    /// Remove an item. Removing a missing item has no effect.
    pub fn remove(&mut self, id: ItemId) -> Option<SchedItem> {
        let idx = self.valid(id)?;
        self.unlink(idx);
        let item = self.slots[idx as usize].item.take();
        self.slots[idx as usize].gen = self.slots[idx as usize].gen.wrapping_add(1);
        let _ = self.free.push(idx);
        item
    }

    /// Move an item to a new window.
    ///
    /// Fails with [`SchedError::InPast`] if `start` is before `now`, and with
    /// [`SchedError::Conflict`] if the window overlaps another item. On error the item keeps its
    /// previous window.
    pub fn reschedule(&mut self, id: ItemId, start: Ticks, end: Ticks, now: Ticks) -> Result<(), SchedError> {
        let idx = self.valid(id).ok_or(SchedError::NotFound)?;
        if start.is_before(now) {
            return Err(SchedError::InPast);
        }
        let kind = match self.slots[idx as usize].item {
            Some(item) => item.kind,
            None => return Err(SchedError::NotFound),
        };
        let item = SchedItem { start, end, kind };
        if self.conflicts(&item, Some(idx)) {
            return Err(SchedError::Conflict);
        }
        self.unlink(idx);
        self.slots[idx as usize].item = Some(item);
        self.link(idx);
        Ok(())
    }

    /// Take the head item if its start has been reached and mark it running.
    pub fn pop_expired(&mut self, now: Ticks) -> Option<(ItemId, SchedItem)> {
        let &idx = self.order.first()?;
        let item = self.slots[idx as usize].item?;
        if item.start.is_after(now) {
            return None;
        }
        self.order.remove(0);
        self.running = Some(idx);
        Some((self.id(idx), item))
    }

    /// The running item gave up the radio. The item stays allocated to its owner.
    pub fn finish(&mut self, id: ItemId) {
        if let Some(idx) = self.valid(id) {
            if self.running == Some(idx) {
                self.running = None;
            }
        }
    }

    fn id(&self, idx: u8) -> ItemId {
        ItemId {
            idx,
            gen: self.slots[idx as usize].gen,
        }
    }

    fn valid(&self, id: ItemId) -> Option<u8> {
        let slot = self.slots.get(id.idx as usize)?;
        (slot.gen == id.gen && slot.item.is_some()).then_some(id.idx)
    }

    fn conflicts(&self, item: &SchedItem, skip: Option<u8>) -> bool {
        self.running
            .iter()
            .chain(self.order.iter())
            .filter(|&&idx| Some(idx) != skip)
            .filter_map(|&idx| self.slots[idx as usize].item)
            .any(|other| item.overlaps(&other))
    }

    fn link(&mut self, idx: u8) {
        let Some(item) = self.slots[idx as usize].item else {
            return;
        };
        let pos = self
            .order
            .iter()
            .position(|&o| {
                self.slots[o as usize]
                    .item
                    .map(|other| other.start.is_after(item.start))
                    .unwrap_or(false)
            })
            .unwrap_or(self.order.len());
        // Capacity equals the arena size, so this cannot overflow.
        let _ = self.order.insert(pos, idx);
    }

    fn unlink(&mut self, idx: u8) {
        if self.running == Some(idx) {
            self.running = None;
        } else if let Some(pos) = self.order.iter().position(|&o| o == idx) {
            self.order.remove(pos);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn adv(start: u32, end: u32) -> SchedItem {
        SchedItem::new(Ticks(start), Ticks(end), SchedKind::Advertising)
    }

    #[test]
    fn ordered_by_start() {
        let mut s: Scheduler<4> = Scheduler::new();
        s.insert(adv(300, 400)).unwrap();
        s.insert(adv(100, 200)).unwrap();
        s.insert(SchedItem::new(Ticks(200), Ticks(300), SchedKind::Connection(1)))
            .unwrap();
        assert_eq!(s.next_start(), Some(Ticks(100)));

        assert!(s.pop_expired(Ticks(99)).is_none());
        let (_, first) = s.pop_expired(Ticks(100)).unwrap();
        assert_eq!(first.start, Ticks(100));
        let (_, second) = s.pop_expired(Ticks(250)).unwrap();
        assert_eq!(second.kind, SchedKind::Connection(1));
        assert_eq!(s.next_start(), Some(Ticks(300)));
    }

    #[test]
    fn overlap_is_rejected() {
        let mut s: Scheduler<4> = Scheduler::new();
        s.insert(adv(100, 200)).unwrap();
        assert_eq!(s.insert(adv(150, 250)), Err(SchedError::Conflict));
        assert_eq!(s.insert(adv(50, 101)), Err(SchedError::Conflict));
        // Touching windows do not overlap.
        s.insert(adv(200, 300)).unwrap();
        s.insert(adv(0, 100)).unwrap();
        assert_eq!(s.len(), 3);
    }

    #[test]
    fn running_item_is_not_preempted() {
        let mut s: Scheduler<4> = Scheduler::new();
        let id = s.insert(adv(100, 200)).unwrap();
        s.pop_expired(Ticks(100)).unwrap();
        assert_eq!(s.running(), Some(id));
        assert_eq!(
            s.insert(SchedItem::new(Ticks(120), Ticks(140), SchedKind::Scan)),
            Err(SchedError::Conflict)
        );
        s.finish(id);
        assert_eq!(s.running(), None);
        assert!(s.get(id).is_some());
    }

    #[test]
    fn first_fit_slides_forward() {
        let mut s: Scheduler<4> = Scheduler::new();
        s.insert(adv(100, 200)).unwrap();
        s.insert(SchedItem::new(Ticks(250), Ticks(400), SchedKind::Connection(0)))
            .unwrap();
        let (_, placed) = s
            .insert_first_fit(SchedItem::new(Ticks(150), Ticks(250), SchedKind::Scan))
            .unwrap();
        assert_eq!(placed.start, Ticks(400));
        assert_eq!(placed.end, Ticks(500));
    }

    #[test]
    fn reschedule_rules() {
        let mut s: Scheduler<4> = Scheduler::new();
        let a = s.insert(adv(100, 200)).unwrap();
        s.insert(SchedItem::new(Ticks(300), Ticks(400), SchedKind::Connection(0)))
            .unwrap();

        assert_eq!(s.reschedule(a, Ticks(50), Ticks(90), Ticks(60)), Err(SchedError::InPast));
        assert_eq!(s.reschedule(a, Ticks(350), Ticks(450), Ticks(60)), Err(SchedError::Conflict));
        assert_eq!(s.get(a).unwrap().start, Ticks(100));

        s.reschedule(a, Ticks(500), Ticks(600), Ticks(60)).unwrap();
        assert_eq!(s.next_start(), Some(Ticks(300)));
        assert_eq!(s.get(a).unwrap().end, Ticks(600));
    }

    #[test]
    fn remove_is_idempotent_and_handles_go_stale() {
        let mut s: Scheduler<2> = Scheduler::new();
        let a = s.insert(adv(100, 200)).unwrap();
        assert!(s.remove(a).is_some());
        assert!(s.remove(a).is_none());
        let b = s.insert(adv(100, 200)).unwrap();
        // The slot is reused but the old handle does not reach the new item.
        assert!(s.remove(a).is_none());
        assert!(s.get(b).is_some());
        assert_eq!(s.reschedule(a, Ticks(0), Ticks(1), Ticks(0)), Err(SchedError::NotFound));
    }

    #[test]
    fn full_arena() {
        let mut s: Scheduler<1> = Scheduler::new();
        s.insert(adv(0, 10)).unwrap();
        assert_eq!(s.insert(adv(20, 30)), Err(SchedError::Full));
        assert_eq!(s.insert_first_fit(adv(20, 30)).unwrap_err(), SchedError::Full);
    }

    #[test]
    fn wraparound_windows() {
        let mut s: Scheduler<2> = Scheduler::new();
        s.insert(adv(u32::MAX - 50, 50)).unwrap();
        assert_eq!(s.insert(adv(10, 20)), Err(SchedError::Conflict));
        s.insert(adv(50, 60)).unwrap();
        assert_eq!(s.next_start(), Some(Ticks(u32::MAX - 50)));
    }
}
