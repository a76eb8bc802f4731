use std::collections::BTreeMap;
use std::fmt;
use std::io;
use std::str::FromStr;
use std::sync::Arc;

use log::{info, trace};
use parking_lot::Mutex;
use serde::Deserialize;

use crate::error::{Result, TapError};
use crate::frame::TaggedFrame;
use crate::listener::{ListenerId, ListenerRegistry};
use crate::stats::Verdict;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Deserialize)]
#[serde(transparent)]
pub struct RuleId(pub u32);

impl fmt::Display for RuleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionKind {
    None,
    Drop,
    Forward,
    Count,
}

impl FromStr for ActionKind {
    type Err = TapError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "none" => Ok(ActionKind::None),
            "drop" => Ok(ActionKind::Drop),
            "forward" => Ok(ActionKind::Forward),
            "count" => Ok(ActionKind::Count),
            other => Err(TapError::invalid(format!("unknown action '{}'", other))),
        }
    }
}

/// What a rule does with a matching frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    None,
    Drop,
    Forward(ListenerId),
    Count,
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Action::None => write!(f, "none"),
            Action::Drop => write!(f, "drop"),
            Action::Forward(l) => write!(f, "forward -> listener {}", l),
            Action::Count => write!(f, "count"),
        }
    }
}

#[derive(Debug)]
pub struct Rule {
    pub id: RuleId,
    pub action: Action,
}

impl Rule {
    /// Executes the action on `frame`. Only `forward` touches the network;
    /// a short or failed send comes back as `TransmissionFailure`.
    pub fn apply(&self, frame: &TaggedFrame, listeners: &ListenerRegistry) -> Result<Verdict> {
        match self.action {
            Action::None => Ok(Verdict::Ignored),
            Action::Drop => Ok(Verdict::Dropped),
            Action::Count => Ok(Verdict::Counted),
            Action::Forward(listener) => {
                let bytes = frame.as_bytes();
                let sent = listeners.send(listener, bytes)?;
                if sent < bytes.len() {
                    return Err(TapError::TransmissionFailure {
                        listener: listener.0,
                        source: io::Error::new(
                            io::ErrorKind::WriteZero,
                            format!("short send: {} of {} bytes", sent, bytes.len()),
                        ),
                    });
                }
                trace!("rule {} forwarded {} bytes to listener {}", self.id, sent, listener);
                Ok(Verdict::Forwarded)
            }
        }
    }
}

/// Rules keyed by id. Entries are immutable; re-adding an id swaps in a new
/// `Arc<Rule>` so readers always see either the old or the new rule.
#[derive(Debug)]
pub struct RuleTable {
    rules: Mutex<BTreeMap<RuleId, Arc<Rule>>>,
    listeners: Arc<ListenerRegistry>,
}

impl RuleTable {
    pub fn new(listeners: Arc<ListenerRegistry>) -> Self {
        RuleTable {
            rules: Mutex::new(BTreeMap::new()),
            listeners,
        }
    }

    pub fn listeners(&self) -> &ListenerRegistry {
        &self.listeners
    }

    /// Adds or replaces a rule. A `forward` rule must name a listener that
    /// exists right now.
    pub fn add(&self, id: RuleId, kind: ActionKind, argument: Option<&str>) -> Result<()> {
        let action = match kind {
            ActionKind::None => Action::None,
            ActionKind::Drop => Action::Drop,
            ActionKind::Count => Action::Count,
            ActionKind::Forward => {
                let arg = argument
                    .map(str::trim)
                    .filter(|a| !a.is_empty())
                    .ok_or_else(|| TapError::invalid(format!("forward rule {} needs a listener id", id)))?;
                let listener = arg
                    .parse::<u32>()
                    .map(ListenerId)
                    .map_err(|_| TapError::invalid(format!("bad listener id '{}'", arg)))?;
                if !self.listeners.contains(listener) {
                    return Err(TapError::invalid(format!(
                        "forward rule {} references unknown listener {}",
                        id, listener
                    )));
                }
                Action::Forward(listener)
            }
        };

        let rule = Arc::new(Rule { id, action });
        let previous = self.rules.lock().insert(id, rule);
        // The replaced rule is released only now, after the new one is live.
        drop(previous);
        info!("Rule {}: {}", id, action);
        Ok(())
    }

    pub fn remove(&self, id: RuleId) -> Result<()> {
        match self.rules.lock().remove(&id) {
            Some(_) => {
                info!("Removed rule {}", id);
                Ok(())
            }
            None => Err(TapError::not_found("rule", id)),
        }
    }

    pub fn clear(&self) {
        let old = std::mem::take(&mut *self.rules.lock());
        info!("Cleared {} rules", old.len());
    }

    pub fn get(&self, id: RuleId) -> Option<Arc<Rule>> {
        self.rules.lock().get(&id).cloned()
    }

    pub fn contains(&self, id: RuleId) -> bool {
        self.rules.lock().contains_key(&id)
    }

    pub fn snapshot(&self) -> Vec<(RuleId, Action)> {
        self.rules.lock().values().map(|r| (r.id, r.action)).collect()
    }
}

// --- UNIT TESTS ---
#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::tagged;
    use crate::parser::LinkType;
    use std::net::UdpSocket;
    use std::time::Duration;

    fn table() -> RuleTable {
        RuleTable::new(Arc::new(ListenerRegistry::new()))
    }

    #[test]
    fn test_forward_rule_requires_live_listener() {
        // ARRANGE
        let rules = table();

        // ACT
        let err = rules.add(RuleId(1), ActionKind::Forward, Some("5")).unwrap_err();

        // ASSERT
        assert!(matches!(err, TapError::InvalidArgument(_)), "unresolved listener must be rejected");
        assert!(!rules.contains(RuleId(1)), "nothing installed on rejection");
    }

    #[test]
    fn test_forward_rule_requires_numeric_argument() {
        let rules = table();
        rules.listeners().add(ListenerId(5), "127.0.0.1", 9).unwrap();

        assert!(rules.add(RuleId(1), ActionKind::Forward, None).is_err());
        assert!(rules.add(RuleId(1), ActionKind::Forward, Some("five")).is_err());
        assert!(rules.add(RuleId(1), ActionKind::Forward, Some(" 5 ")).is_ok());
    }

    #[test]
    fn test_readd_replaces_rule() {
        // ARRANGE
        let rules = table();
        rules.add(RuleId(1), ActionKind::Drop, None).unwrap();
        let old = rules.get(RuleId(1)).unwrap();

        // ACT
        rules.add(RuleId(1), ActionKind::Count, None).unwrap();

        // ASSERT
        assert_eq!(old.action, Action::Drop, "readers holding the old rule keep it");
        assert_eq!(rules.get(RuleId(1)).unwrap().action, Action::Count);
        assert_eq!(rules.snapshot().len(), 1);
    }

    #[test]
    fn test_remove_unknown_rule() {
        let rules = table();
        rules.add(RuleId(1), ActionKind::Drop, None).unwrap();

        let err = rules.remove(RuleId(2)).unwrap_err();

        assert!(err.is_not_found());
        assert!(rules.contains(RuleId(1)), "other rules untouched");
    }

    #[test]
    fn test_action_kind_parsing() {
        assert_eq!("Forward".parse::<ActionKind>().unwrap(), ActionKind::Forward);
        assert_eq!(" count".parse::<ActionKind>().unwrap(), ActionKind::Count);
        assert!("mirror".parse::<ActionKind>().is_err());
    }

    #[test]
    fn test_apply_verdicts() {
        let listeners = ListenerRegistry::new();
        let frame = tagged(&[1, 2, 3], LinkType::Radiotap);

        for (action, verdict) in [
            (Action::None, Verdict::Ignored),
            (Action::Drop, Verdict::Dropped),
            (Action::Count, Verdict::Counted),
        ] {
            let rule = Rule { id: RuleId(1), action };
            assert_eq!(rule.apply(&frame, &listeners).unwrap(), verdict);
        }
    }

    #[test]
    fn test_apply_forward_sends_tagged_bytes() {
        // ARRANGE
        let receiver = UdpSocket::bind("127.0.0.1:0").unwrap();
        receiver.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
        let listeners = ListenerRegistry::new();
        listeners
            .add(ListenerId(1), "127.0.0.1", receiver.local_addr().unwrap().port())
            .unwrap();
        let frame = tagged(&[0xaa, 0xbb], LinkType::Radiotap);
        let rule = Rule { id: RuleId(4), action: Action::Forward(ListenerId(1)) };

        // ACT
        let verdict = rule.apply(&frame, &listeners).unwrap();

        // ASSERT
        let mut buf = [0u8; 64];
        let n = receiver.recv(&mut buf).unwrap();
        assert_eq!(verdict, Verdict::Forwarded);
        assert_eq!(&buf[..n], frame.as_bytes());
    }

    #[test]
    fn test_apply_forward_to_removed_listener_fails() {
        let listeners = ListenerRegistry::new();
        let frame = tagged(&[0], LinkType::Radiotap);
        let rule = Rule { id: RuleId(4), action: Action::Forward(ListenerId(1)) };

        assert!(rule.apply(&frame, &listeners).is_err());
    }
}
