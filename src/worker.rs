use std::io;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_channel::Receiver;
use log::{debug, info, warn};

use crate::chain::ChainEngine;
use crate::device::DeviceShared;
use crate::frame::TaggedFrame;
use crate::pool::WorkItem;
use crate::stats::Verdict;

/// Starts the device's worker thread. It consumes work items in the order
/// they were queued and returns each one to the pool when done.
pub fn spawn(
    device: Arc<DeviceShared>,
    rx: Receiver<Box<WorkItem>>,
    engine: Arc<ChainEngine>,
) -> io::Result<JoinHandle<()>> {
    thread::Builder::new()
        .name(format!("rtap-worker-{}", device.name))
        .spawn(move || run(&device, &rx, &engine))
}

fn run(device: &DeviceShared, rx: &Receiver<Box<WorkItem>>, engine: &ChainEngine) {
    debug!("Worker for {} started", device.name);

    // Ends once the capture hook, the only sender, is gone.
    while let Ok(item) = rx.recv() {
        if device.is_accepting() {
            process(device, engine, &item);
        } else {
            device.stats.record_discard();
        }
        device.pool.release(item);
    }

    info!("Worker for {} exiting", device.name);
}

/// Stamps the metadata header onto a copy of the frame and classifies it.
/// Returns `None` if the copy could not be made.
pub(crate) fn process(device: &DeviceShared, engine: &ChainEngine, item: &WorkItem) -> Option<Verdict> {
    if item.frame.is_truncated() {
        device.stats.record_truncated();
        debug!(
            "{}: packet {} truncated ({} of {} bytes), forwarding anyway",
            device.name,
            item.sequence,
            item.frame.len(),
            item.frame.wire_len()
        );
    }

    let tagged = match TaggedFrame::stamp(device.hwaddr, item.sequence, item.bytes, &item.frame) {
        Ok(tagged) => tagged,
        Err(e) => {
            device.stats.record_allocation_failure();
            warn!("{}: dropping packet {}: {}", device.name, item.sequence, e);
            return None;
        }
    };

    let verdict = engine.process(&tagged);
    debug!("{}: packet {} -> {:?}", device.name, item.sequence, verdict);
    Some(verdict)
}
