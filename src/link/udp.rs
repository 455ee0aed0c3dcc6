//! UDP Link Driver
//!
//! A stand-in radio for development and the demo daemon: every UDP peer
//! address is one neighbor link. Neighbors come from configuration, and a
//! datagram from an unknown address materializes a new inbound link, the
//! way a radio would surface a newly connected device.
//!
//! One socket serves all neighbors. Each link gets its own bounded write
//! queue drained by a dedicated task, so there is a single writer per
//! neighbor and a slow neighbor cannot stall the others.

use super::{LinkDriver, LinkError, LinkEvent, LinkEventTx, LinkId};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Per-link write queue depth.
const WRITE_QUEUE_DEPTH: usize = 64;

/// UDP link configuration (`link.udp.*`).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct UdpLinkConfig {
    /// Local bind address (`link.udp.bind_addr`).
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    /// Largest frame accepted for transmission (`link.udp.mtu`).
    #[serde(default = "default_mtu")]
    pub mtu: u16,

    /// Neighbor addresses to link at startup (`link.udp.neighbors`).
    #[serde(default)]
    pub neighbors: Vec<String>,
}

fn default_bind_addr() -> String {
    "0.0.0.0:4810".to_string()
}

fn default_mtu() -> u16 {
    1400
}

impl Default for UdpLinkConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            mtu: default_mtu(),
            neighbors: Vec::new(),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum DriverState {
    Configured,
    Up,
    Down,
}

struct Inner {
    state: DriverState,
    socket: Option<Arc<UdpSocket>>,
    links: HashMap<LinkId, SocketAddr>,
    by_addr: HashMap<SocketAddr, LinkId>,
    writers: HashMap<LinkId, mpsc::Sender<Vec<u8>>>,
    next_link_id: u64,
    tasks: Vec<JoinHandle<()>>,
}

impl Inner {
    fn new() -> Self {
        Self {
            state: DriverState::Configured,
            socket: None,
            links: HashMap::new(),
            by_addr: HashMap::new(),
            writers: HashMap::new(),
            next_link_id: 1,
            tasks: Vec::new(),
        }
    }

    /// Register a link to `addr` and spawn its writer task.
    fn add_link(&mut self, addr: SocketAddr, socket: &Arc<UdpSocket>) -> LinkId {
        let link = LinkId::new(self.next_link_id);
        self.next_link_id += 1;

        let (write_tx, mut write_rx) = mpsc::channel::<Vec<u8>>(WRITE_QUEUE_DEPTH);
        let writer_socket = socket.clone();
        let task = tokio::spawn(async move {
            while let Some(frame) = write_rx.recv().await {
                if let Err(e) = writer_socket.send_to(&frame, addr).await {
                    debug!(remote = %addr, error = %e, "udp send failed");
                }
            }
        });

        self.links.insert(link, addr);
        self.by_addr.insert(addr, link);
        self.writers.insert(link, write_tx);
        self.tasks.push(task);
        link
    }
}

/// UDP implementation of the link seam.
pub struct UdpLink {
    config: UdpLinkConfig,
    events: LinkEventTx,
    inner: Arc<Mutex<Inner>>,
}

impl UdpLink {
    /// Create a driver; `start` binds the socket.
    pub fn new(config: UdpLinkConfig, events: LinkEventTx) -> Self {
        Self {
            config,
            events,
            inner: Arc::new(Mutex::new(Inner::new())),
        }
    }

    /// The locally bound address (only valid after start).
    pub fn local_addr(&self) -> Option<SocketAddr> {
        let inner = self.inner.lock().expect("udp link lock");
        inner.socket.as_ref().and_then(|s| s.local_addr().ok())
    }
}

impl LinkDriver for UdpLink {
    fn name(&self) -> &'static str {
        "udp"
    }

    fn start(&self) -> Result<(), LinkError> {
        let mut inner = self.inner.lock().expect("udp link lock");
        if inner.state == DriverState::Up {
            return Err(LinkError::AlreadyStarted);
        }

        let bind_addr: SocketAddr = self
            .config
            .bind_addr
            .parse()
            .map_err(|e| LinkError::StartFailed(format!("invalid bind address: {}", e)))?;

        let std_socket = std::net::UdpSocket::bind(bind_addr)
            .map_err(|e| LinkError::StartFailed(format!("bind failed: {}", e)))?;
        std_socket
            .set_nonblocking(true)
            .map_err(|e| LinkError::StartFailed(format!("set_nonblocking: {}", e)))?;
        let socket = Arc::new(
            UdpSocket::from_std(std_socket)
                .map_err(|e| LinkError::StartFailed(format!("socket registration: {}", e)))?,
        );

        inner.socket = Some(socket.clone());

        // Configured neighbors become links immediately.
        let mut up_links = Vec::new();
        for neighbor in &self.config.neighbors {
            let addr: SocketAddr = match neighbor.parse() {
                Ok(a) => a,
                Err(e) => {
                    warn!(neighbor = %neighbor, error = %e, "ignoring bad neighbor address");
                    continue;
                }
            };
            up_links.push(inner.add_link(addr, &socket));
        }

        // Receive loop: frames in, unknown senders become new links.
        let reader_inner = self.inner.clone();
        let reader_events = self.events.clone();
        let reader_socket = socket;
        let mtu = self.config.mtu;
        let reader = tokio::spawn(async move {
            let mut buf = vec![0u8; mtu as usize + 100];
            loop {
                match reader_socket.recv_from(&mut buf).await {
                    Ok((len, remote)) => {
                        let new_link = {
                            let mut inner = reader_inner.lock().expect("udp link lock");
                            if inner.state != DriverState::Up {
                                break;
                            }
                            match inner.by_addr.get(&remote) {
                                Some(_) => None,
                                None => {
                                    let socket =
                                        inner.socket.clone().expect("socket present while up");
                                    Some(inner.add_link(remote, &socket))
                                }
                            }
                        };

                        let link = if let Some(link) = new_link {
                            info!(link = %link, remote = %remote, "inbound neighbor linked");
                            if reader_events.send(LinkEvent::Up(link)).await.is_err() {
                                break;
                            }
                            link
                        } else {
                            let inner = reader_inner.lock().expect("udp link lock");
                            inner.by_addr[&remote]
                        };

                        let frame = buf[..len].to_vec();
                        if reader_events
                            .send(LinkEvent::Frame { link, data: frame })
                            .await
                            .is_err()
                        {
                            break;
                        }
                    }
                    Err(e) => {
                        warn!(error = %e, "udp receive error");
                    }
                }
            }
            debug!("udp receive loop stopped");
        });

        inner.tasks.push(reader);
        inner.state = DriverState::Up;
        info!(bind = %self.config.bind_addr, neighbors = inner.links.len(), "udp link started");
        drop(inner);

        // Announce configured neighbors once the driver is marked up.
        for link in up_links {
            if self.events.try_send(LinkEvent::Up(link)).is_err() {
                warn!(link = %link, "link event channel full at startup");
            }
        }

        Ok(())
    }

    fn stop(&self) {
        let mut inner = self.inner.lock().expect("udp link lock");
        if inner.state != DriverState::Up {
            return;
        }
        inner.state = DriverState::Down;
        for task in inner.tasks.drain(..) {
            task.abort();
        }
        inner.writers.clear();
        inner.links.clear();
        inner.by_addr.clear();
        inner.socket = None;
        debug!("udp link stopped");
    }

    fn links(&self) -> Vec<LinkId> {
        let inner = self.inner.lock().expect("udp link lock");
        inner.links.keys().copied().collect()
    }

    fn send(&self, link: LinkId, frame: &[u8]) -> Result<(), LinkError> {
        let inner = self.inner.lock().expect("udp link lock");
        if inner.state != DriverState::Up {
            return Err(LinkError::NotStarted);
        }
        if frame.len() > self.config.mtu as usize {
            return Err(LinkError::MtuExceeded {
                frame_size: frame.len(),
                mtu: self.config.mtu,
            });
        }

        let writer = inner.writers.get(&link).ok_or(LinkError::UnknownLink(link))?;
        writer
            .try_send(frame.to_vec())
            .map_err(|_| LinkError::QueueFull(link))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::link_event_channel;
    use tokio::time::{timeout, Duration};

    fn test_config(neighbors: Vec<String>) -> UdpLinkConfig {
        UdpLinkConfig {
            bind_addr: "127.0.0.1:0".to_string(),
            mtu: 1400,
            neighbors,
        }
    }

    #[tokio::test]
    async fn test_start_stop() {
        let (tx, _rx) = link_event_channel(16);
        let link = UdpLink::new(test_config(vec![]), tx);

        link.start().unwrap();
        assert!(link.local_addr().is_some());
        assert!(matches!(link.start(), Err(LinkError::AlreadyStarted)));

        link.stop();
        assert!(link.links().is_empty());
    }

    #[tokio::test]
    async fn test_configured_neighbor_becomes_link() {
        let (tx, mut rx) = link_event_channel(16);
        let link = UdpLink::new(test_config(vec!["127.0.0.1:9".to_string()]), tx);
        link.start().unwrap();

        assert_eq!(link.links().len(), 1);
        assert!(matches!(rx.recv().await, Some(LinkEvent::Up(_))));
        link.stop();
    }

    #[tokio::test]
    async fn test_frames_flow_between_drivers() {
        let (tx_a, mut rx_a) = link_event_channel(16);
        let a = UdpLink::new(test_config(vec![]), tx_a);
        a.start().unwrap();
        let addr_a = a.local_addr().unwrap();

        let (tx_b, mut rx_b) = link_event_channel(16);
        let b = UdpLink::new(test_config(vec![addr_a.to_string()]), tx_b);
        b.start().unwrap();

        let link_to_a = match rx_b.recv().await {
            Some(LinkEvent::Up(l)) => l,
            other => panic!("expected Up, got {:?}", other),
        };

        b.send(link_to_a, b"ping").unwrap();

        // A sees a new inbound link, then the frame
        match timeout(Duration::from_secs(1), rx_a.recv()).await.unwrap() {
            Some(LinkEvent::Up(_)) => {}
            other => panic!("expected Up, got {:?}", other),
        }
        let link_to_b = match timeout(Duration::from_secs(1), rx_a.recv()).await.unwrap() {
            Some(LinkEvent::Frame { link, data }) => {
                assert_eq!(data, b"ping");
                link
            }
            other => panic!("expected Frame, got {:?}", other),
        };

        // And can answer on that link
        a.send(link_to_b, b"pong").unwrap();
        loop {
            match timeout(Duration::from_secs(1), rx_b.recv()).await.unwrap() {
                Some(LinkEvent::Frame { data, .. }) => {
                    assert_eq!(data, b"pong");
                    break;
                }
                Some(_) => continue,
                None => panic!("channel closed"),
            }
        }

        a.stop();
        b.stop();
    }

    #[tokio::test]
    async fn test_send_errors() {
        let (tx, _rx) = link_event_channel(16);
        let link = UdpLink::new(test_config(vec![]), tx);

        assert!(matches!(
            link.send(LinkId::new(1), b"x"),
            Err(LinkError::NotStarted)
        ));

        link.start().unwrap();
        assert!(matches!(
            link.send(LinkId::new(99), b"x"),
            Err(LinkError::UnknownLink(_))
        ));

        link.stop();
    }

    #[tokio::test]
    async fn test_mtu_guard() {
        let (tx, _rx) = link_event_channel(16);
        let mut config = test_config(vec!["127.0.0.1:9".to_string()]);
        config.mtu = 100;
        let link = UdpLink::new(config, tx);
        link.start().unwrap();

        let target = link.links()[0];
        assert!(matches!(
            link.send(target, &[0u8; 200]),
            Err(LinkError::MtuExceeded { .. })
        ));
        link.stop();
    }
}
