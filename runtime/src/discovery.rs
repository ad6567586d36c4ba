use std::{
    net::{IpAddr, Ipv4Addr, SocketAddr},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use anyhow::Context;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::{net::UdpSocket, sync::broadcast, sync::Mutex, task::JoinHandle};
use tracing::{debug, info, warn};

use lumi_common::{parse_frame, Frame};

use crate::{epoch_ms, registry::DeviceRegistry};

const EVENT_CAPACITY: usize = 64;
const MAX_DATAGRAM: usize = 2048;

/// One parsed datagram, fanned out to whoever is listening: the scan
/// orchestrator during a scan window, device sessions for live state.
#[derive(Debug, Clone)]
pub struct DiscoveryEvent {
    pub source: IpAddr,
    pub frame: Frame,
}

/// Background UDP listener on the discovery port. Every valid frame updates
/// the registry and is rebroadcast as a [`DiscoveryEvent`].
pub struct DiscoveryListener {
    registry: DeviceRegistry,
    port: u16,
    active: Arc<AtomicBool>,
    events: broadcast::Sender<DiscoveryEvent>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl DiscoveryListener {
    pub fn new(registry: DeviceRegistry, port: u16) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            registry,
            port,
            active: Arc::new(AtomicBool::new(false)),
            events,
            task: Mutex::new(None),
        }
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DiscoveryEvent> {
        self.events.subscribe()
    }

    /// Bind the discovery socket and start the receive loop, returning the
    /// bound port (useful when the configured port is 0). Idempotent: a
    /// second call while the loop is running does nothing and returns the
    /// configured port.
    pub async fn start(&self) -> anyhow::Result<u16> {
        if self.active.swap(true, Ordering::SeqCst) {
            return Ok(self.port);
        }

        let socket = match bind_shared(self.port) {
            Ok(socket) => socket,
            Err(err) => {
                self.active.store(false, Ordering::SeqCst);
                return Err(err);
            }
        };
        let port = socket
            .local_addr()
            .context("discovery socket has no local address")?
            .port();
        info!(port, "discovery listener started");

        let registry = self.registry.clone();
        let events = self.events.clone();
        let active = Arc::clone(&self.active);
        let handle = tokio::spawn(async move {
            let mut buf = [0u8; MAX_DATAGRAM];
            loop {
                let (len, peer) = match socket.recv_from(&mut buf).await {
                    Ok(received) => received,
                    Err(err) => {
                        warn!(error = %err, "discovery socket closed");
                        active.store(false, Ordering::SeqCst);
                        return;
                    }
                };
                handle_datagram(&registry, &events, &buf[..len], peer).await;
            }
        });
        *self.task.lock().await = Some(handle);

        Ok(port)
    }

    pub async fn stop(&self) {
        if let Some(handle) = self.task.lock().await.take() {
            handle.abort();
        }
        self.active.store(false, Ordering::SeqCst);
    }
}

async fn handle_datagram(
    registry: &DeviceRegistry,
    events: &broadcast::Sender<DiscoveryEvent>,
    payload: &[u8],
    peer: SocketAddr,
) {
    let frame = match parse_frame(payload) {
        Ok(frame) => frame,
        Err(err) if err.is_foreign() => {
            debug!(%peer, "ignoring foreign datagram");
            return;
        }
        Err(err) => {
            warn!(%peer, error = %err, "dropping malformed frame");
            return;
        }
    };

    let now_ms = epoch_ms();
    let source = match &frame {
        Frame::KeepAlive(addr) => {
            registry.mark_seen(*addr, now_ms).await;
            *addr
        }
        Frame::State(state) => {
            let source = state.ip.unwrap_or(peer.ip());
            registry.apply_state_frame(state, source, now_ms).await;
            source
        }
    };

    // No receivers is normal outside a scan window.
    let _ = events.send(DiscoveryEvent { source, frame });
}

/// Bind the discovery port with address reuse so the listener coexists with
/// anything else sharing the port on this host.
fn bind_shared(port: u16) -> anyhow::Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))
        .context("failed to create discovery socket")?;
    socket.set_reuse_address(true)?;
    #[cfg(unix)]
    socket.set_reuse_port(true)?;
    socket.set_nonblocking(true)?;

    let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port);
    socket
        .bind(&addr.into())
        .with_context(|| format!("failed to bind udp port {port}"))?;

    UdpSocket::from_std(socket.into()).context("failed to register discovery socket")
}
