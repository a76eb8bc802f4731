use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, UdpSocket};
use std::sync::Arc;

use log::{debug, info};
use parking_lot::Mutex;

use crate::error::{Result, TapError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ListenerId(pub u32);

impl fmt::Display for ListenerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A UDP destination for forwarded frames. The socket closes when the last
/// `Arc<Listener>` goes away, so a send in flight finishes on the old socket
/// even if the entry is replaced meanwhile.
#[derive(Debug)]
pub struct Listener {
    id: ListenerId,
    endpoint: SocketAddr,
    socket: UdpSocket,
}

impl Listener {
    fn open(id: ListenerId, endpoint: SocketAddr) -> Result<Self> {
        let bind: SocketAddr = match endpoint {
            SocketAddr::V4(_) => (Ipv4Addr::UNSPECIFIED, 0).into(),
            SocketAddr::V6(_) => (Ipv6Addr::UNSPECIFIED, 0).into(),
        };
        let socket = UdpSocket::bind(bind)?;
        Ok(Listener { id, endpoint, socket })
    }

    pub fn id(&self) -> ListenerId {
        self.id
    }

    pub fn endpoint(&self) -> SocketAddr {
        self.endpoint
    }

    /// One datagram, no retry.
    pub fn send(&self, bytes: &[u8]) -> Result<usize> {
        self.socket
            .send_to(bytes, self.endpoint)
            .map_err(|source| TapError::TransmissionFailure {
                listener: self.id.0,
                source,
            })
    }
}

/// Registered forwarding destinations, kept in insertion order. At most one
/// entry exists per id and at most one per endpoint.
#[derive(Debug, Default)]
pub struct ListenerRegistry {
    listeners: Mutex<Vec<Arc<Listener>>>,
}

impl ListenerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Installs a listener, replacing whatever was bound to the same id or
    /// the same endpoint. Returns how many entries were replaced.
    pub fn add(&self, id: ListenerId, address: &str, port: u16) -> Result<usize> {
        let ip: IpAddr = address
            .trim()
            .parse()
            .map_err(|_| TapError::invalid(format!("bad listener address '{}'", address)))?;
        let endpoint = SocketAddr::new(ip, port);
        let listener = Arc::new(Listener::open(id, endpoint)?);

        let replaced: Vec<Arc<Listener>> = {
            let mut listeners = self.listeners.lock();
            let (gone, kept): (Vec<_>, Vec<_>) = listeners
                .drain(..)
                .partition(|l| l.id == id || l.endpoint == endpoint);
            *listeners = kept;
            listeners.push(listener);
            gone
        };

        for old in &replaced {
            debug!("Closing listener {} ({})", old.id, old.endpoint);
        }
        info!("Listener {} -> {}", id, endpoint);
        Ok(replaced.len())
    }

    pub fn remove(&self, id: ListenerId) -> Result<()> {
        let removed = {
            let mut listeners = self.listeners.lock();
            let pos = listeners.iter().position(|l| l.id == id);
            pos.map(|pos| listeners.remove(pos))
        };
        match removed {
            Some(l) => {
                info!("Removed listener {} ({})", l.id, l.endpoint);
                Ok(())
            }
            None => Err(TapError::not_found("listener", id)),
        }
    }

    pub fn clear(&self) {
        let drained: Vec<_> = self.listeners.lock().drain(..).collect();
        info!("Cleared {} listeners", drained.len());
    }

    pub fn get(&self, id: ListenerId) -> Option<Arc<Listener>> {
        self.listeners.lock().iter().find(|l| l.id == id).cloned()
    }

    pub fn contains(&self, id: ListenerId) -> bool {
        self.listeners.lock().iter().any(|l| l.id == id)
    }

    pub fn len(&self) -> usize {
        self.listeners.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn snapshot(&self) -> Vec<(ListenerId, SocketAddr)> {
        self.listeners.lock().iter().map(|l| (l.id, l.endpoint)).collect()
    }

    /// Best-effort send to the listener registered as `id`. The registry lock
    /// is released before the datagram goes out.
    pub fn send(&self, id: ListenerId, bytes: &[u8]) -> Result<usize> {
        let listener = self.get(id).ok_or_else(|| TapError::not_found("listener", id))?;
        listener.send(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_same_endpoint_replaces_previous_listener() {
        // ARRANGE
        let registry = ListenerRegistry::new();
        registry.add(ListenerId(1), "1.2.3.4", 9999).unwrap();
        let first = registry.get(ListenerId(1)).unwrap();

        // ACT
        let replaced = registry.add(ListenerId(2), "1.2.3.4", 9999).unwrap();

        // ASSERT
        assert_eq!(replaced, 1);
        assert_eq!(registry.len(), 1, "exactly one live listener per endpoint");
        assert!(registry.get(ListenerId(1)).is_none());
        assert_eq!(Arc::strong_count(&first), 1, "registry no longer holds the old socket");
    }

    #[test]
    fn test_same_id_rebinds() {
        let registry = ListenerRegistry::new();
        registry.add(ListenerId(1), "10.0.0.1", 8888).unwrap();

        registry.add(ListenerId(1), "10.0.0.2", 8888).unwrap();

        assert_eq!(
            registry.snapshot(),
            vec![(ListenerId(1), "10.0.0.2:8888".parse().unwrap())]
        );
    }

    #[test]
    fn test_remove_unknown_is_not_found_and_harmless() {
        let registry = ListenerRegistry::new();
        registry.add(ListenerId(1), "127.0.0.1", 8888).unwrap();

        let err = registry.remove(ListenerId(7)).unwrap_err();

        assert!(err.is_not_found());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_bad_address_is_rejected() {
        let registry = ListenerRegistry::new();

        let err = registry.add(ListenerId(1), "not-an-ip", 8888).unwrap_err();

        assert!(matches!(err, TapError::InvalidArgument(_)));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_send_reaches_loopback_receiver() {
        // ARRANGE
        let receiver = UdpSocket::bind("127.0.0.1:0").unwrap();
        receiver.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
        let port = receiver.local_addr().unwrap().port();
        let registry = ListenerRegistry::new();
        registry.add(ListenerId(3), "127.0.0.1", port).unwrap();

        // ACT
        let sent = registry.send(ListenerId(3), b"hello").unwrap();

        // ASSERT
        let mut buf = [0u8; 16];
        let n = receiver.recv(&mut buf).unwrap();
        assert_eq!(sent, 5);
        assert_eq!(&buf[..n], b"hello");
    }

    #[test]
    fn test_send_to_unknown_listener() {
        let registry = ListenerRegistry::new();

        let err = registry.send(ListenerId(9), b"x").unwrap_err();

        assert!(err.is_not_found());
    }
}
