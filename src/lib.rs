// In src/lib.rs
mod capture;
mod chain;
mod device;
mod error;
mod filter;
mod frame;
mod listener;
mod parser;
mod pool;
mod rules;
mod settings;
mod stats;
mod tap;
mod worker;

pub use capture::{list_devices, start_capture, CaptureHook};
pub use chain::{ChainEngine, FilterSnapshot, MatchResult};
pub use device::{lookup_interface, Device, DeviceRegistry, DeviceSnapshot, DeviceStats};
pub use error::{Result, TapError};
pub use filter::{Filter, FilterId, Layer, Predicate, Transport};
pub use frame::{Frame, MetadataHeader, TaggedFrame, HEADER_LEN, HEADER_MAGIC, HEADER_VERSION};
pub use listener::{Listener, ListenerId, ListenerRegistry};
// Export everything needed from the parser module
pub use parser::{handle_packet, Ieee80211Header, LinkType, PacketInfo, RadiotapHeader};
pub use pool::{WorkItem, WorkPool, DEFAULT_CAPACITY};
pub use rules::{Action, ActionKind, Rule, RuleId, RuleTable};
pub use settings::{CaptureSettings, Settings, TapTable};
pub use stats::{CounterSnapshot, Counters, Statistics, Verdict};
pub use tap::Tap;
