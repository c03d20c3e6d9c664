//! Reference-counted slot table
//!
//! Freed slots go onto a LIFO free list and are reused with a bumped
//! generation, so an old `SlotId` is detected as stale.

use tether_sdk::{NativeError, NativeResult, NativeValue, ObjectId, SlotId, SlotRelease};

/// One slot in the table
#[derive(Debug)]
pub(crate) struct Slot {
    pub value: NativeValue,
    pub refs: u32,
    pub generation: u32,
    pub anchor: ObjectId,
    pub weak: bool,
    pub live: bool,
}

/// Slot storage with a LIFO free list
#[derive(Debug, Default)]
pub(crate) struct SlotTable {
    slots: Vec<Slot>,
    free: Vec<u32>,
}

impl SlotTable {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            slots: Vec::with_capacity(capacity),
            free: Vec::new(),
        }
    }

    /// Allocate a slot with one reference
    pub fn allocate(&mut self, value: NativeValue) -> SlotId {
        if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index as usize];
            slot.value = value;
            slot.refs = 1;
            slot.anchor = ObjectId::UNSET;
            slot.weak = false;
            slot.live = true;
            return SlotId::new(index, slot.generation);
        }

        let index = self.slots.len() as u32;
        self.slots.push(Slot {
            value,
            refs: 1,
            generation: 0,
            anchor: ObjectId::UNSET,
            weak: false,
            live: true,
        });
        SlotId::new(index, 0)
    }

    /// Allocate a slot kept alive by its anchor only
    pub fn allocate_anchored(&mut self, value: NativeValue, object: ObjectId) -> SlotId {
        let id = self.allocate(value);
        let slot = &mut self.slots[id.index() as usize];
        slot.refs = 0;
        slot.anchor = object;
        id
    }

    pub fn get(&self, id: SlotId) -> NativeResult<&Slot> {
        match self.slots.get(id.index() as usize) {
            Some(slot) if slot.live && slot.generation == id.generation() => Ok(slot),
            _ => Err(NativeError::StaleSlot(id)),
        }
    }

    pub fn get_mut(&mut self, id: SlotId) -> NativeResult<&mut Slot> {
        match self.slots.get_mut(id.index() as usize) {
            Some(slot) if slot.live && slot.generation == id.generation() => Ok(slot),
            _ => Err(NativeError::StaleSlot(id)),
        }
    }

    pub fn retain(&mut self, id: SlotId) -> NativeResult<u32> {
        let slot = self.get_mut(id)?;
        slot.refs += 1;
        Ok(slot.refs)
    }

    pub fn release(&mut self, id: SlotId) -> NativeResult<SlotRelease> {
        let slot = self.get_mut(id)?;
        if slot.refs == 0 {
            return Err(NativeError::OverRelease(id));
        }
        slot.refs -= 1;
        if slot.refs > 0 {
            return Ok(SlotRelease::Retained(slot.refs));
        }
        if slot.anchor.is_tracked() {
            return Ok(SlotRelease::Deferred(slot.anchor));
        }
        self.free(id);
        Ok(SlotRelease::Freed)
    }

    pub fn anchor(&mut self, id: SlotId, object: ObjectId) -> NativeResult<()> {
        self.get_mut(id)?.anchor = object;
        Ok(())
    }

    pub fn release_anchor(&mut self, id: SlotId) -> NativeResult<SlotRelease> {
        let slot = self.get_mut(id)?;
        slot.anchor = ObjectId::UNSET;
        slot.weak = false;
        if slot.refs > 0 {
            return Ok(SlotRelease::Retained(slot.refs));
        }
        self.free(id);
        Ok(SlotRelease::Freed)
    }

    fn free(&mut self, id: SlotId) {
        let slot = &mut self.slots[id.index() as usize];
        slot.live = false;
        slot.value = NativeValue::Undefined;
        slot.anchor = ObjectId::UNSET;
        slot.weak = false;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(id.index());
    }

    /// Live slots with their ids
    pub fn iter_live(&self) -> impl Iterator<Item = (SlotId, &Slot)> + '_ {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.live)
            .map(|(index, slot)| (SlotId::new(index as u32, slot.generation), slot))
    }

    pub fn iter_live_mut(&mut self) -> impl Iterator<Item = (SlotId, &mut Slot)> + '_ {
        self.slots
            .iter_mut()
            .enumerate()
            .filter(|(_, slot)| slot.live)
            .map(|(index, slot)| (SlotId::new(index as u32, slot.generation), slot))
    }

    pub fn live_count(&self) -> usize {
        self.slots.len() - self.free.len()
    }

    pub fn free_count(&self) -> usize {
        self.free.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_release_frees_and_bumps_generation() {
        let mut table = SlotTable::default();
        let id = table.allocate(NativeValue::Int32(1));
        assert_eq!(table.release(id), Ok(SlotRelease::Freed));
        assert_eq!(table.get(id).unwrap_err(), NativeError::StaleSlot(id));

        let reused = table.allocate(NativeValue::Int32(2));
        assert_eq!(reused.index(), id.index());
        assert_eq!(reused.generation(), id.generation() + 1);
    }

    #[test]
    fn test_free_list_is_lifo() {
        let mut table = SlotTable::default();
        let a = table.allocate(NativeValue::Null);
        let b = table.allocate(NativeValue::Null);
        table.release(a).unwrap();
        table.release(b).unwrap();
        assert_eq!(table.allocate(NativeValue::Null).index(), b.index());
        assert_eq!(table.allocate(NativeValue::Null).index(), a.index());
    }

    #[test]
    fn test_anchored_release_is_deferred() {
        let mut table = SlotTable::default();
        let id = table.allocate(NativeValue::Null);
        table.anchor(id, ObjectId::new(3)).unwrap();
        assert_eq!(table.release(id), Ok(SlotRelease::Deferred(ObjectId::new(3))));
        assert!(table.get(id).is_ok());
        assert_eq!(table.release_anchor(id), Ok(SlotRelease::Freed));
        assert!(table.get(id).is_err());
    }

    #[test]
    fn test_release_anchor_keeps_referenced_slot() {
        let mut table = SlotTable::default();
        let id = table.allocate(NativeValue::Null);
        table.anchor(id, ObjectId::new(0)).unwrap();
        assert_eq!(table.release_anchor(id), Ok(SlotRelease::Retained(1)));
        assert_eq!(table.release(id), Ok(SlotRelease::Freed));
    }

    #[test]
    fn test_over_release_detected() {
        let mut table = SlotTable::default();
        let id = table.allocate(NativeValue::Null);
        table.anchor(id, ObjectId::new(0)).unwrap();
        table.release(id).unwrap();
        assert_eq!(table.release(id), Err(NativeError::OverRelease(id)));
    }

    #[test]
    fn test_counts() {
        let mut table = SlotTable::with_capacity(4);
        let a = table.allocate(NativeValue::Null);
        table.allocate(NativeValue::Null);
        table.release(a).unwrap();
        assert_eq!(table.live_count(), 1);
        assert_eq!(table.free_count(), 1);
    }
}
