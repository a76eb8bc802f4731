use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::bounded;
use log::{debug, info, warn};
use parking_lot::Mutex;
use pnet_datalink::MacAddr;

use crate::capture::{self, CaptureHook};
use crate::chain::ChainEngine;
use crate::error::{Result, TapError};
use crate::parser::LinkType;
use crate::pool::WorkPool;
use crate::settings::CaptureSettings;
use crate::worker;

/// Per-device tallies, updated from the capture hook and the worker.
#[derive(Debug, Default)]
pub struct DeviceStats {
    packets: AtomicU64,
    bytes: AtomicU64,
    drops: AtomicU64,
    truncated: AtomicU64,
    allocation_failures: AtomicU64,
    discarded: AtomicU64,
}

impl DeviceStats {
    /// Counts a captured frame; returns its packet id and the cumulative
    /// byte count including it.
    pub(crate) fn seen(&self, len: usize) -> (u32, u64) {
        let packets = self.packets.fetch_add(1, Ordering::Relaxed).wrapping_add(1);
        let bytes = self.bytes.fetch_add(len as u64, Ordering::Relaxed) + len as u64;
        (packets as u32, bytes)
    }

    pub(crate) fn record_drop(&self) {
        self.drops.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_truncated(&self) {
        self.truncated.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_allocation_failure(&self) {
        self.allocation_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_discard(&self) {
        self.discarded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn packets(&self) -> u64 {
        self.packets.load(Ordering::Relaxed)
    }

    pub fn bytes(&self) -> u64 {
        self.bytes.load(Ordering::Relaxed)
    }

    /// Frames shed because the pool was empty.
    pub fn drops(&self) -> u64 {
        self.drops.load(Ordering::Relaxed)
    }

    /// Frames captured shorter than they were on the wire.
    pub fn truncated(&self) -> u64 {
        self.truncated.load(Ordering::Relaxed)
    }

    pub fn allocation_failures(&self) -> u64 {
        self.allocation_failures.load(Ordering::Relaxed)
    }

    /// Queued frames thrown away while the device was stopping.
    pub fn discarded(&self) -> u64 {
        self.discarded.load(Ordering::Relaxed)
    }
}

/// State shared by a device's capture hook and its worker.
#[derive(Debug)]
pub struct DeviceShared {
    pub name: String,
    pub hwaddr: [u8; 6],
    pub pool: WorkPool,
    pub stats: DeviceStats,
    accepting: AtomicBool,
}

impl DeviceShared {
    pub(crate) fn new(name: &str, hwaddr: [u8; 6], pool: WorkPool) -> Self {
        DeviceShared {
            name: name.to_string(),
            hwaddr,
            pool,
            stats: DeviceStats::default(),
            accepting: AtomicBool::new(true),
        }
    }

    pub fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::Acquire)
    }

    pub(crate) fn stop_accepting(&self) {
        self.accepting.store(false, Ordering::Release);
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceSnapshot {
    pub name: String,
    pub hwaddr: [u8; 6],
    pub packets: u64,
    pub bytes: u64,
    pub drops: u64,
    pub truncated: u64,
    pub allocation_failures: u64,
    pub discarded: u64,
    pub free_items: usize,
}

/// One capture-bound interface with its pool and dedicated worker thread.
#[derive(Debug)]
pub struct Device {
    shared: Arc<DeviceShared>,
    hook: Option<CaptureHook>,
    capture: Option<JoinHandle<()>>,
    worker: Option<JoinHandle<()>>,
}

impl Device {
    /// Builds the pool and queue and starts the worker. Frames arrive through
    /// [`Device::deliver`] until [`Device::start_capture`] attaches pcap.
    pub fn spawn(
        name: &str,
        hwaddr: [u8; 6],
        capacity: usize,
        snaplen: usize,
        engine: Arc<ChainEngine>,
    ) -> Result<Self> {
        let pool = WorkPool::new(capacity, snaplen)?;
        let shared = Arc::new(DeviceShared::new(name, hwaddr, pool));
        // Never more items in flight than the pool holds, so the queue
        // cannot fill up before the pool runs dry.
        let (tx, rx) = bounded(capacity);
        let worker = worker::spawn(Arc::clone(&shared), rx, engine)?;
        info!("Device {} ready ({} work items)", name, capacity);
        Ok(Device {
            hook: Some(CaptureHook::new(Arc::clone(&shared), tx)),
            shared,
            capture: None,
            worker: Some(worker),
        })
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn start_capture(&mut self, settings: &CaptureSettings) -> Result<()> {
        if self.capture.is_some() {
            return Err(TapError::invalid(format!("device {} is already capturing", self.name())));
        }
        let hook = self
            .hook
            .clone()
            .ok_or_else(|| TapError::invalid(format!("device {} is stopped", self.name())))?;
        self.capture = Some(capture::start_capture(hook, settings)?);
        Ok(())
    }

    /// Queues a frame as the capture thread would. Fails with
    /// `ResourceExhausted` when the frame was shed.
    pub fn deliver(&self, data: &[u8], wire_len: u32, timestamp: Duration, link: LinkType) -> Result<()> {
        match &self.hook {
            Some(hook) => hook.deliver(data, wire_len, timestamp, link),
            None => Err(TapError::invalid(format!("device {} is stopped", self.name()))),
        }
    }

    pub fn snapshot(&self) -> DeviceSnapshot {
        let s = &self.shared.stats;
        DeviceSnapshot {
            name: self.shared.name.clone(),
            hwaddr: self.shared.hwaddr,
            packets: s.packets(),
            bytes: s.bytes(),
            drops: s.drops(),
            truncated: s.truncated(),
            allocation_failures: s.allocation_failures(),
            discarded: s.discarded(),
            free_items: self.shared.pool.free_count(),
        }
    }

    /// Stops accepting frames, joins the capture thread, closes the queue and
    /// joins the worker once it has handed every queued item back to the pool.
    pub fn stop(&mut self) {
        if self.hook.is_none() && self.worker.is_none() {
            return;
        }
        self.shared.stop_accepting();

        if let Some(handle) = self.capture.take() {
            if handle.join().is_err() {
                warn!("Capture thread of {} panicked", self.shared.name);
            }
        }
        // Last sender gone: the worker drains what is queued and exits.
        self.hook = None;
        if let Some(handle) = self.worker.take() {
            if handle.join().is_err() {
                warn!("Worker thread of {} panicked", self.shared.name);
            }
        }

        let pool = &self.shared.pool;
        if pool.free_count() != pool.capacity() {
            warn!(
                "Device {} stopped with {} work items unaccounted for",
                self.shared.name,
                pool.capacity() - pool.free_count()
            );
        }
        info!("Device {} stopped", self.shared.name);
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Looks up a system interface and returns its hardware address.
pub fn lookup_interface(name: &str) -> Result<[u8; 6]> {
    let iface = pnet_datalink::interfaces()
        .into_iter()
        .find(|i| i.name == name)
        .ok_or_else(|| TapError::not_found("device", name))?;
    let MacAddr(a, b, c, d, e, f) = iface.mac.unwrap_or_else(MacAddr::zero);
    debug!("Found interface {} (index {})", iface.name, iface.index);
    Ok([a, b, c, d, e, f])
}

/// All bound devices, by name.
#[derive(Debug)]
pub struct DeviceRegistry {
    devices: Mutex<Vec<Device>>,
    engine: Arc<ChainEngine>,
    capacity: usize,
    capture: CaptureSettings,
}

impl DeviceRegistry {
    pub fn new(engine: Arc<ChainEngine>, capacity: usize, capture: CaptureSettings) -> Result<Self> {
        if capacity == 0 {
            return Err(TapError::invalid("work-item pool capacity must be at least 1"));
        }
        capture.validate()?;
        Ok(DeviceRegistry {
            devices: Mutex::new(Vec::new()),
            engine,
            capacity,
            capture,
        })
    }

    /// Binds the named interface, tearing down an existing binding of the
    /// same name first.
    pub fn add(&self, name: &str) -> Result<()> {
        let name = name.trim();
        if self.remove(name).is_ok() {
            debug!("Replacing device {}", name);
        }
        let hwaddr = lookup_interface(name)?;
        let mut device = Device::spawn(
            name,
            hwaddr,
            self.capacity,
            self.capture.snaplen,
            Arc::clone(&self.engine),
        )?;
        device.start_capture(&self.capture)?;
        self.attach(device);
        Ok(())
    }

    /// Registers an already running device, replacing any of the same name.
    pub fn attach(&self, device: Device) {
        let replaced = {
            let mut devices = self.devices.lock();
            let old = devices
                .iter()
                .position(|d| d.name() == device.name())
                .map(|pos| devices.remove(pos));
            devices.push(device);
            old
        };
        // Dropping outside the lock joins the old threads.
        drop(replaced);
    }

    pub fn remove(&self, name: &str) -> Result<()> {
        let removed = {
            let mut devices = self.devices.lock();
            let pos = devices.iter().position(|d| d.name() == name);
            pos.map(|pos| devices.remove(pos))
        };
        match removed {
            Some(mut device) => {
                device.stop();
                Ok(())
            }
            None => Err(TapError::not_found("device", name)),
        }
    }

    pub fn clear(&self) {
        let devices = std::mem::take(&mut *self.devices.lock());
        for mut device in devices {
            device.stop();
        }
    }

    /// Hands a frame to the named device as if it had been captured there.
    pub fn deliver(&self, name: &str, data: &[u8], timestamp: Duration, link: LinkType) -> Result<()> {
        let devices = self.devices.lock();
        let device = devices
            .iter()
            .find(|d| d.name() == name)
            .ok_or_else(|| TapError::not_found("device", name))?;
        device.deliver(data, data.len() as u32, timestamp, link)
    }

    pub fn snapshot(&self) -> Vec<DeviceSnapshot> {
        self.devices.lock().iter().map(Device::snapshot).collect()
    }
}

impl Drop for DeviceRegistry {
    fn drop(&mut self) {
        self.clear();
    }
}
