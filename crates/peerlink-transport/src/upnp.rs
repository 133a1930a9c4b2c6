//! Optional UPnP port mapping for the listening port.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::time::Duration;

use igd::PortMappingProtocol;
use igd::aio::{Gateway, search_gateway};
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{TransportError, TransportResult};

const DESCRIPTION: &str = "peerlink";

/// An active mapping on the local gateway.
#[derive(Debug)]
pub struct PortMapping {
    gateway: Gateway,
    local: SocketAddrV4,
    external_port: u16,
    lease: Duration,
}

impl PortMapping {
    /// Discovers the gateway and maps `port` to this host for `lease`.
    pub async fn create(port: u16, lease: Duration) -> TransportResult<Self> {
        let gateway = search_gateway(Default::default())
            .await
            .map_err(|e| TransportError::PortMapping(e.to_string()))?;
        let local_ip = local_ipv4_towards(gateway.addr).await?;
        let mapping = Self {
            gateway,
            local: SocketAddrV4::new(local_ip, port),
            external_port: port,
            lease,
        };
        mapping.renew().await?;
        info!(local = %mapping.local, external_port = port, "UPnP mapping created");
        Ok(mapping)
    }

    /// External port on the gateway.
    #[must_use]
    pub const fn external_port(&self) -> u16 {
        self.external_port
    }

    /// The gateway's external address.
    pub async fn external_ip(&self) -> TransportResult<Ipv4Addr> {
        self.gateway
            .get_external_ip()
            .await
            .map_err(|e| TransportError::PortMapping(e.to_string()))
    }

    /// Re-registers the mapping for another lease period.
    pub async fn renew(&self) -> TransportResult<()> {
        self.gateway
            .add_port(
                PortMappingProtocol::TCP,
                self.external_port,
                self.local,
                self.lease.as_secs() as u32,
                DESCRIPTION,
            )
            .await
            .map_err(|e| TransportError::PortMapping(e.to_string()))
    }

    /// Removes the mapping from the gateway.
    pub async fn remove(&self) -> TransportResult<()> {
        self.gateway
            .remove_port(PortMappingProtocol::TCP, self.external_port)
            .await
            .map_err(|e| TransportError::PortMapping(e.to_string()))
    }

    /// Renews the mapping at half the lease until `closed` fires, then
    /// removes it.
    pub async fn maintain(self, closed: CancellationToken) {
        let interval = (self.lease / 2).max(Duration::from_secs(1));
        loop {
            tokio::select! {
                () = closed.cancelled() => break,
                () = tokio::time::sleep(interval) => {
                    if let Err(e) = self.renew().await {
                        warn!(error = %e, "UPnP renewal failed");
                    } else {
                        debug!(external_port = self.external_port, "UPnP mapping renewed");
                    }
                }
            }
        }
        if let Err(e) = self.remove().await {
            debug!(error = %e, "UPnP mapping removal failed");
        }
    }
}

async fn local_ipv4_towards(gateway: SocketAddrV4) -> TransportResult<Ipv4Addr> {
    let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).await?;
    socket.connect(gateway).await?;
    match socket.local_addr()? {
        SocketAddr::V4(addr) => Ok(*addr.ip()),
        SocketAddr::V6(_) => Err(TransportError::PortMapping(
            "no IPv4 route to gateway".into(),
        )),
    }
}
