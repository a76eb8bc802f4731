use std::fmt::Write as _;
use std::sync::Arc;
use std::time::Duration;

use log::{info, warn};

use crate::chain::{ChainEngine, FilterSnapshot};
use crate::device::{Device, DeviceRegistry, DeviceSnapshot};
use crate::error::Result;
use crate::filter::{Filter, FilterId};
use crate::listener::{ListenerId, ListenerRegistry};
use crate::parser::LinkType;
use crate::rules::{ActionKind, RuleId, RuleTable};
use crate::settings::{CaptureSettings, TapTable};
use crate::stats::Statistics;

/// One complete tap: listeners, rules, chains, statistics and the devices
/// feeding them. Nothing is global, so independent instances can coexist.
#[derive(Debug)]
pub struct Tap {
    listeners: Arc<ListenerRegistry>,
    rules: Arc<RuleTable>,
    engine: Arc<ChainEngine>,
    stats: Arc<Statistics>,
    devices: DeviceRegistry,
    capacity: usize,
    snaplen: usize,
}

impl Tap {
    pub fn new(capacity: usize, capture: CaptureSettings) -> Result<Self> {
        let listeners = Arc::new(ListenerRegistry::new());
        let rules = Arc::new(RuleTable::new(Arc::clone(&listeners)));
        let stats = Arc::new(Statistics::new());
        let engine = Arc::new(ChainEngine::new(Arc::clone(&rules), Arc::clone(&stats)));
        let snaplen = capture.snaplen;
        let devices = DeviceRegistry::new(Arc::clone(&engine), capacity, capture)?;
        Ok(Tap {
            listeners,
            rules,
            engine,
            stats,
            devices,
            capacity,
            snaplen,
        })
    }

    pub fn engine(&self) -> &Arc<ChainEngine> {
        &self.engine
    }

    pub fn statistics(&self) -> &Statistics {
        &self.stats
    }

    // --- devices ---

    pub fn add_device(&self, name: &str) -> Result<()> {
        self.devices.add(name)
    }

    /// Binds a device that is fed through [`Tap::deliver`] instead of pcap.
    pub fn add_detached_device(&self, name: &str, hwaddr: [u8; 6]) -> Result<()> {
        let device = Device::spawn(name, hwaddr, self.capacity, self.snaplen, Arc::clone(&self.engine))?;
        self.devices.attach(device);
        Ok(())
    }

    pub fn remove_device(&self, name: &str) -> Result<()> {
        self.devices.remove(name)
    }

    pub fn clear_devices(&self) {
        self.devices.clear();
    }

    /// Injects a frame on a device, as its capture hook would.
    pub fn deliver(&self, device: &str, frame: &[u8], timestamp: Duration, link: LinkType) -> Result<()> {
        self.devices.deliver(device, frame, timestamp, link)
    }

    pub fn devices(&self) -> Vec<DeviceSnapshot> {
        self.devices.snapshot()
    }

    // --- chains and filters ---

    pub fn add_chain(&self, name: &str) -> Result<()> {
        self.engine.add_chain(name)
    }

    pub fn remove_chain(&self, name: &str) -> Result<()> {
        self.engine.remove_chain(name)
    }

    pub fn clear_chain(&self, name: &str) -> Result<()> {
        self.engine.clear_chain(name)
    }

    pub fn add_filter(
        &self,
        chain: &str,
        id: FilterId,
        layer: &str,
        subtype: &str,
        rule: RuleId,
        argument: &str,
    ) -> Result<()> {
        let filter = Filter::parse(id, layer, subtype, rule, argument)?;
        self.engine.add_filter(chain, filter)
    }

    pub fn remove_filter(&self, chain: &str, id: FilterId) -> Result<()> {
        self.engine.remove_filter(chain, id)
    }

    pub fn reset_statistics(&self, id: FilterId) -> Result<()> {
        self.engine.reset_statistics(id)
    }

    pub fn filters(&self) -> Vec<FilterSnapshot> {
        self.engine.snapshot()
    }

    // --- rules ---

    pub fn add_rule(&self, id: RuleId, kind: ActionKind, argument: Option<&str>) -> Result<()> {
        self.rules.add(id, kind, argument)
    }

    pub fn remove_rule(&self, id: RuleId) -> Result<()> {
        self.rules.remove(id)
    }

    pub fn clear_rules(&self) {
        self.rules.clear();
    }

    // --- listeners ---

    pub fn add_listener(&self, id: ListenerId, address: &str, port: u16) -> Result<()> {
        self.listeners.add(id, address, port).map(|_| ())
    }

    pub fn remove_listener(&self, id: ListenerId) -> Result<()> {
        self.listeners.remove(id)
    }

    pub fn clear_listeners(&self) {
        self.listeners.clear();
    }

    /// Sets up everything in `table`: listeners, then rules, then chains,
    /// then devices. Stops at the first entry that is rejected.
    pub fn apply(&self, table: &TapTable) -> Result<()> {
        for l in &table.listeners {
            self.add_listener(ListenerId(l.id), &l.address, l.port)?;
        }
        for r in &table.rules {
            let argument = r.listener.map(|id| id.to_string());
            self.add_rule(r.id, r.action, argument.as_deref())?;
        }
        for c in &table.chains {
            self.add_chain(&c.name)?;
            for f in &c.filters {
                self.add_filter(&c.name, f.id, &f.layer, &f.subtype, f.rule, &f.argument)?;
            }
        }
        for name in &table.devices {
            self.add_device(name)?;
        }
        info!(
            "Applied table: {} listeners, {} rules, {} chains, {} devices",
            table.listeners.len(),
            table.rules.len(),
            table.chains.len(),
            table.devices.len()
        );
        Ok(())
    }

    /// Tears everything down, devices first so no worker is left running.
    pub fn shutdown(&self) {
        self.clear_devices();
        self.engine.clear();
        self.clear_rules();
        self.clear_listeners();
        info!("Tap shut down");
    }

    /// Human-readable listing of the whole tap.
    pub fn report(&self) -> String {
        let mut out = String::new();
        if let Err(e) = self.write_report(&mut out) {
            warn!("Failed to format report: {}", e);
        }
        out
    }

    fn write_report(&self, out: &mut String) -> std::fmt::Result {
        writeln!(out, "devices:")?;
        for d in self.devices() {
            writeln!(
                out,
                "  {:<12} {} packets={} bytes={} drops={} truncated={} alloc_failures={} free={}",
                d.name,
                format_mac(&d.hwaddr),
                d.packets,
                d.bytes,
                d.drops,
                d.truncated,
                d.allocation_failures,
                d.free_items
            )?;
        }

        writeln!(out, "listeners:")?;
        for (id, endpoint) in self.listeners.snapshot() {
            writeln!(out, "  {:>3} {}", id.0, endpoint)?;
        }

        writeln!(out, "rules:")?;
        for (id, action) in self.rules.snapshot() {
            writeln!(out, "  {:>3} {}", id.0, action)?;
        }

        writeln!(out, "chains:")?;
        for name in self.engine.chain_names() {
            writeln!(out, "  {}", name)?;
        }

        writeln!(out, "----------------------------------------------------------------------------------")?;
        writeln!(out, "| fid | chain        | matches    |    total   |  forwarded |   dropped  |   counted  |   errors   |")?;
        let global = self.stats.snapshot();
        writeln!(out, "| all | {:<12} | {:>10} | {} |", "-", "-", global)?;
        for f in self.filters() {
            writeln!(out, "| {:>3} | {:<12} | {:>10} | {} |", f.id.0, f.chain, f.matches, f.counters)?;
        }
        writeln!(out, "unmatched: {}", self.stats.unmatched())?;
        Ok(())
    }
}

impl Drop for Tap {
    fn drop(&mut self) {
        self.clear_devices();
    }
}

fn format_mac(mac: &[u8; 6]) -> String {
    mac.iter().map(|b| format!("{:02x}", b)).collect::<Vec<_>>().join(":")
}
