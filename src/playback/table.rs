//! Active-decoder table
//!
//! Fixed-size array of atomic slot pointers scanned by the render callback.
//! The worker installs slots with a CAS on the first empty entry; the
//! collector removes them with a CAS back to null and is the sole destroyer.
//!
//! Ownership protocol: `install` transfers ownership of the boxed slot into
//! the table. `take_removable`/`take_all` transfer it back out as raw
//! pointers, which the collector destroys only after a grace window, so a
//! render pass that loaded a pointer just before removal never dereferences
//! freed memory.

use crate::playback::slot::{flag, DecoderSlot};
use std::ptr;
use std::sync::atomic::{AtomicPtr, Ordering};

pub struct ActiveSlotTable {
    entries: Box<[AtomicPtr<DecoderSlot>]>,
}

impl ActiveSlotTable {
    pub fn new(size: usize) -> Self {
        let entries = (0..size)
            .map(|_| AtomicPtr::new(ptr::null_mut()))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        ActiveSlotTable { entries }
    }

    pub fn size(&self) -> usize {
        self.entries.len()
    }

    /// Install a slot into the first empty entry.
    ///
    /// Slot construction happens-before the store: the CAS uses Release so
    /// the render callback's Acquire load observes a fully built slot.
    /// Returns the slot back when every entry is occupied.
    pub(crate) fn install(&self, slot: Box<DecoderSlot>) -> Result<(), Box<DecoderSlot>> {
        let raw = Box::into_raw(slot);
        for entry in self.entries.iter() {
            if entry
                .compare_exchange(ptr::null_mut(), raw, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return Ok(());
            }
        }
        Err(unsafe { Box::from_raw(raw) })
    }

    /// Visit every installed slot.
    pub(crate) fn for_each<F: FnMut(&DecoderSlot)>(&self, mut f: F) {
        for entry in self.entries.iter() {
            let p = entry.load(Ordering::Acquire);
            if !p.is_null() {
                f(unsafe { &*p });
            }
        }
    }

    /// The renderable slot with the smallest sequence number greater than
    /// `after` (or the smallest overall when `after` is `None`).
    ///
    /// Used by the render callback to walk slots in enqueue order without
    /// allocating.
    pub(crate) fn renderable_after(&self, after: Option<u64>) -> Option<&DecoderSlot> {
        let mut best: Option<&DecoderSlot> = None;
        for entry in self.entries.iter() {
            let p = entry.load(Ordering::Acquire);
            if p.is_null() {
                continue;
            }
            let slot = unsafe { &*p };
            if !slot.is_renderable() {
                continue;
            }
            if let Some(lo) = after {
                if slot.sequence <= lo {
                    continue;
                }
            }
            match best {
                Some(b) if b.sequence <= slot.sequence => {}
                _ => best = Some(slot),
            }
        }
        best
    }

    /// The current front slot: smallest-sequence renderable entry.
    pub(crate) fn front_renderable(&self) -> Option<&DecoderSlot> {
        self.renderable_after(None)
    }

    /// The slot the worker should decode next: smallest sequence still
    /// needing decode work.
    pub(crate) fn lowest_needing_decode(&self) -> Option<&DecoderSlot> {
        let mut best: Option<&DecoderSlot> = None;
        for entry in self.entries.iter() {
            let p = entry.load(Ordering::Acquire);
            if p.is_null() {
                continue;
            }
            let slot = unsafe { &*p };
            if !slot.needs_decoding() {
                continue;
            }
            match best {
                Some(b) if b.sequence <= slot.sequence => {}
                _ => best = Some(slot),
            }
        }
        best
    }

    /// The lowest-sequence slot with a seek pending. Cancelled and removed
    /// slots are skipped; cancellation wins over a stale seek request.
    pub(crate) fn lowest_pending_seek(&self) -> Option<&DecoderSlot> {
        let mut best: Option<&DecoderSlot> = None;
        for entry in self.entries.iter() {
            let p = entry.load(Ordering::Acquire);
            if p.is_null() {
                continue;
            }
            let slot = unsafe { &*p };
            if slot.pending_seek().is_none()
                || slot.cancel_requested()
                || slot.has_flags(flag::MARKED_FOR_REMOVAL)
            {
                continue;
            }
            match best {
                Some(b) if b.sequence <= slot.sequence => {}
                _ => best = Some(slot),
            }
        }
        best
    }

    /// Number of entries whose slot is not marked for removal.
    pub fn active_count(&self) -> usize {
        let mut count = 0;
        self.for_each(|slot| {
            if !slot.has_flags(flag::MARKED_FOR_REMOVAL) {
                count += 1;
            }
        });
        count
    }

    pub fn has_renderable(&self) -> bool {
        self.front_renderable().is_some()
    }

    /// CAS out every slot eligible for destruction and append the raw
    /// pointers to `out`. Called only by the collector.
    pub(crate) fn take_removable(&self, out: &mut Vec<*mut DecoderSlot>) {
        for entry in self.entries.iter() {
            let p = entry.load(Ordering::Acquire);
            if p.is_null() {
                continue;
            }
            let slot = unsafe { &*p };
            let eligible = slot.has_flags(flag::MARKED_FOR_REMOVAL)
                || slot.has_flags(flag::DECODING_FINISHED | flag::RENDERING_FINISHED);
            if eligible
                && entry
                    .compare_exchange(p, ptr::null_mut(), Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
            {
                out.push(p);
            }
        }
    }

    /// CAS out every slot regardless of state. Shutdown only, with the
    /// render callback already stopped.
    pub(crate) fn take_all(&self, out: &mut Vec<*mut DecoderSlot>) {
        for entry in self.entries.iter() {
            let p = entry.swap(ptr::null_mut(), Ordering::AcqRel);
            if !p.is_null() {
                out.push(p);
            }
        }
    }
}

impl Drop for ActiveSlotTable {
    fn drop(&mut self) {
        for entry in self.entries.iter() {
            let p = entry.swap(ptr::null_mut(), Ordering::AcqRel);
            if !p.is_null() {
                drop(unsafe { Box::from_raw(p) });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::converter::Converter;
    use crate::audio::decoder::Decoder;
    use crate::audio::types::AudioFormat;
    use crate::error::Result;

    struct StubDecoder(AudioFormat);

    impl Decoder for StubDecoder {
        fn open(&mut self) -> Result<()> {
            Ok(())
        }
        fn is_open(&self) -> bool {
            true
        }
        fn format(&self) -> AudioFormat {
            self.0.clone()
        }
        fn frame_length(&self) -> i64 {
            -1
        }
        fn current_frame(&self) -> i64 {
            0
        }
        fn read(&mut self, _buf: &mut [f32], _max_frames: usize) -> Result<usize> {
            Ok(0)
        }
    }

    fn boxed_slot(sequence: u64) -> Box<DecoderSlot> {
        let format = AudioFormat::pcm_f32(48_000, 2);
        let converter = Converter::new(&format, &format, 2_048).unwrap();
        Box::new(DecoderSlot::new(
            sequence,
            Box::new(StubDecoder(format)),
            converter,
        ))
    }

    #[test]
    fn test_install_until_full() {
        let table = ActiveSlotTable::new(2);
        assert!(table.install(boxed_slot(1)).is_ok());
        assert!(table.install(boxed_slot(2)).is_ok());

        let rejected = table.install(boxed_slot(3));
        assert!(rejected.is_err());
        assert_eq!(rejected.unwrap_err().sequence, 3);
        assert_eq!(table.active_count(), 2);
    }

    #[test]
    fn test_renderable_walk_is_sequence_ordered() {
        let table = ActiveSlotTable::new(4);
        // Install out of order; the walk must still be ascending
        table.install(boxed_slot(5)).unwrap();
        table.install(boxed_slot(2)).unwrap();
        table.install(boxed_slot(9)).unwrap();

        let mut seen = Vec::new();
        let mut cursor = None;
        while let Some(slot) = table.renderable_after(cursor) {
            seen.push(slot.sequence);
            cursor = Some(slot.sequence);
        }
        assert_eq!(seen, vec![2, 5, 9]);
    }

    #[test]
    fn test_front_skips_finished_slots() {
        let table = ActiveSlotTable::new(4);
        table.install(boxed_slot(1)).unwrap();
        table.install(boxed_slot(2)).unwrap();

        let front = table.front_renderable().unwrap();
        assert_eq!(front.sequence, 1);
        front.set_flags(flag::RENDERING_FINISHED | flag::MARKED_FOR_REMOVAL);

        assert_eq!(table.front_renderable().unwrap().sequence, 2);
    }

    #[test]
    fn test_take_removable_requires_terminal_flags() {
        let table = ActiveSlotTable::new(4);
        table.install(boxed_slot(1)).unwrap();
        table.install(boxed_slot(2)).unwrap();

        let mut removed = Vec::new();
        table.take_removable(&mut removed);
        assert!(removed.is_empty());

        table.front_renderable().unwrap().finish_cancelled();
        table.take_removable(&mut removed);
        assert_eq!(removed.len(), 1);
        assert_eq!(table.active_count(), 1);

        for p in removed {
            drop(unsafe { Box::from_raw(p) });
        }
    }

    #[test]
    fn test_lowest_needing_decode() {
        let table = ActiveSlotTable::new(4);
        table.install(boxed_slot(3)).unwrap();
        table.install(boxed_slot(1)).unwrap();

        let lowest = table.lowest_needing_decode().unwrap();
        assert_eq!(lowest.sequence, 1);
        lowest.set_flags(flag::DECODING_FINISHED);

        assert_eq!(table.lowest_needing_decode().unwrap().sequence, 3);
    }

    #[test]
    fn test_drop_frees_remaining_slots() {
        let table = ActiveSlotTable::new(2);
        table.install(boxed_slot(1)).unwrap();
        drop(table); // must not leak or double-free (asserted by sanitizers)
    }
}
