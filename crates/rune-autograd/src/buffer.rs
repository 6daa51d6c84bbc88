//! Per-node gradient staging buffer.
//!
//! One buffer per scheduled node, one slot per output of that node. A slot
//! follows write-once-shared → copy-then-accumulate: the first write stores
//! the incoming value as-is and marks the slot shared (the producing
//! operation, or whoever handed it over, may still hold an alias of its
//! storage); the second write clones once into an exclusively owned value
//! and accumulates in place; every later write accumulates in place. That
//! keeps clone count at exactly one per slot that sees fan-in of order two
//! or more, and zero otherwise.

use rune_core::Value;

pub(crate) struct GradBuffer<V> {
    slots: Vec<Option<V>>,
    /// Parallel marks: slot holds a value some other party may alias.
    shared: Vec<bool>,
}

impl<V: Value> GradBuffer<V> {
    pub fn new(num_outputs: usize) -> Self {
        Self {
            slots: (0..num_outputs).map(|_| None).collect(),
            shared: vec![false; num_outputs],
        }
    }

    /// Store an owned value into an empty slot, no shared mark. Used for
    /// root seeding, where the engine takes the initial gradient by value.
    pub fn seed(&mut self, slot: usize, value: V) {
        debug_assert!(self.slots[slot].is_none(), "seeding an occupied slot");
        self.slots[slot] = Some(value);
    }

    /// Route an incoming gradient into a slot.
    pub fn accumulate(&mut self, slot: usize, incoming: V) {
        let shared = &mut self.shared[slot];
        let entry = &mut self.slots[slot];
        match entry {
            None => {
                *entry = Some(incoming);
                *shared = true;
            }
            Some(existing) => {
                if *shared {
                    let mut owned = existing.clone();
                    owned.accumulate(&incoming);
                    *entry = Some(owned);
                    *shared = false;
                } else {
                    existing.accumulate(&incoming);
                }
            }
        }
    }

    /// Consume the buffer for dispatch. Slots that never received a
    /// gradient stay `None`; they are passed to the operation as "no
    /// gradient", never zero-filled.
    pub fn into_slots(self) -> Vec<Option<V>> {
        self.slots
    }
}
