//! Slot collector
//!
//! Low-priority periodic task (also woken on demand) that removes completed
//! or cancelled slots from the active table and destroys them. Removal is a
//! CAS back to null, so the render callback cannot pick the slot up again;
//! destruction is deferred by a grace window so a render pass that loaded
//! the pointer just before removal never dereferences freed memory.

use crate::playback::engine::Shared;
use crate::playback::slot::DecoderSlot;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Instant;
use tracing::{debug, info, trace};

pub(crate) fn spawn(shared: Arc<Shared>) -> std::io::Result<JoinHandle<()>> {
    std::thread::Builder::new()
        .name("gapless-collector".into())
        .spawn(move || run(shared))
}

fn run(shared: Arc<Shared>) {
    let interval = shared.config.collector_interval();
    let grace = shared.config.collector_grace();

    // Slots removed from the table, awaiting their grace window
    let mut graveyard: Vec<(Instant, *mut DecoderSlot)> = Vec::new();
    let mut removed: Vec<*mut DecoderSlot> = Vec::new();

    info!("collector started (interval {:?}, grace {:?})", interval, grace);

    loop {
        shared.collector_sem.wait_timeout(interval);

        let now = Instant::now();
        graveyard.retain(|&(removed_at, ptr)| {
            if now.duration_since(removed_at) >= grace {
                trace!("destroying slot");
                drop(unsafe { Box::from_raw(ptr) });
                false
            } else {
                true
            }
        });

        if shared.state.shutdown.load(Ordering::Acquire) {
            break;
        }

        removed.clear();
        shared.table.take_removable(&mut removed);
        if !removed.is_empty() {
            debug!("collected {} slot(s)", removed.len());
            for &ptr in &removed {
                graveyard.push((now, ptr));
            }
            // A freed entry may unblock a worker waiting on a full table
            shared.worker_sem.signal();
        }
    }

    // Shutdown: the facade stops the output before raising the flag, so no
    // render pass can still hold a pointer. Destroy everything now.
    removed.clear();
    shared.table.take_all(&mut removed);
    for ptr in removed.drain(..) {
        drop(unsafe { Box::from_raw(ptr) });
    }
    for (_, ptr) in graveyard.drain(..) {
        drop(unsafe { Box::from_raw(ptr) });
    }

    info!("collector stopped");
}
