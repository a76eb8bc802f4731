use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::Sender;
use log::{info, log_enabled, trace, warn, Level};
use pcap::{Capture, Device, PacketHeader};

use crate::device::DeviceShared;
use crate::error::{Result, TapError};
use crate::parser::LinkType;
use crate::pool::WorkItem;
use crate::settings::CaptureSettings;

/// The receive side of a device: turns a captured frame into a work item and
/// queues it for the worker. `on_frame` never blocks and does not allocate
/// unless trace logging is on.
#[derive(Debug, Clone)]
pub struct CaptureHook {
    device: Arc<DeviceShared>,
    tx: Sender<Box<WorkItem>>,
}

impl CaptureHook {
    pub(crate) fn new(device: Arc<DeviceShared>, tx: Sender<Box<WorkItem>>) -> Self {
        CaptureHook { device, tx }
    }

    pub fn device_name(&self) -> &str {
        &self.device.name
    }

    pub fn is_accepting(&self) -> bool {
        self.device.is_accepting()
    }

    /// Queues one frame. Returns `false` if the device is stopping or the
    /// frame had to be shed because the pool is empty.
    pub fn on_frame(&self, data: &[u8], wire_len: u32, timestamp: Duration, link: LinkType) -> bool {
        match self.enqueue(data, wire_len, timestamp, link) {
            Ok(()) => true,
            Err(Shed::Exhausted) => {
                if log_enabled!(Level::Trace) {
                    trace!("{}", self.exhausted());
                }
                false
            }
            Err(Shed::Stopping) => false,
        }
    }

    /// Same as [`CaptureHook::on_frame`], but says why a frame was not
    /// queued: `ResourceExhausted` when the pool is empty.
    pub fn deliver(&self, data: &[u8], wire_len: u32, timestamp: Duration, link: LinkType) -> Result<()> {
        self.enqueue(data, wire_len, timestamp, link).map_err(|shed| match shed {
            Shed::Exhausted => self.exhausted(),
            Shed::Stopping => TapError::invalid(format!("device {} is stopping", self.device.name)),
        })
    }

    fn exhausted(&self) -> TapError {
        TapError::ResourceExhausted {
            device: self.device.name.clone(),
        }
    }

    fn enqueue(&self, data: &[u8], wire_len: u32, timestamp: Duration, link: LinkType) -> std::result::Result<(), Shed> {
        let dev = &self.device;
        if !dev.is_accepting() {
            return Err(Shed::Stopping);
        }

        let (sequence, bytes) = dev.stats.seen(data.len());
        let Some(mut item) = dev.pool.allocate() else {
            dev.stats.record_drop();
            return Err(Shed::Exhausted);
        };

        item.frame.fill(data, wire_len, timestamp, link);
        item.sequence = sequence;
        item.bytes = bytes;

        self.tx.try_send(item).map_err(|e| {
            // Only reachable when the worker is gone.
            dev.pool.release(e.into_inner());
            dev.stats.record_drop();
            Shed::Stopping
        })
    }
}

// Why a frame was not queued.
enum Shed {
    Stopping,
    Exhausted,
}

fn timestamp(header: &PacketHeader) -> Duration {
    let secs = header.ts.tv_sec.max(0) as u64;
    let micros = header.ts.tv_usec.max(0) as u64;
    Duration::from_secs(secs) + Duration::from_micros(micros)
}

/// Opens the hook's interface with pcap and feeds every captured frame to
/// the hook from a dedicated thread, until the device stops accepting.
pub fn start_capture(hook: CaptureHook, settings: &CaptureSettings) -> Result<JoinHandle<()>> {
    let name = hook.device_name().to_string();
    let mut cap = Capture::from_device(name.as_str())?
        .promisc(settings.promiscuous)
        .snaplen(settings.snaplen as i32)
        .timeout(settings.read_timeout_ms)
        .open()?;
    let link = LinkType::from_datalink(cap.get_datalink().0);
    info!("Capturing on {} ({:?} framing)", name, link);

    let handle = thread::Builder::new()
        .name(format!("rtap-capture-{}", name))
        .spawn(move || {
            // Main capture loop
            while hook.is_accepting() {
                match cap.next_packet() {
                    Ok(packet) => {
                        hook.on_frame(packet.data, packet.header.len, timestamp(packet.header), link);
                    }
                    Err(pcap::Error::TimeoutExpired) => continue,
                    Err(e) => {
                        warn!("Capture on {} ended: {}", name, e);
                        break;
                    }
                }
            }
            info!("Capture thread for {} shutting down", name);
        })?;
    Ok(handle)
}

/// Lists the interfaces pcap can open.
pub fn list_devices() -> Result<Vec<Device>> {
    Ok(Device::list()?)
}
