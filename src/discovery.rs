use std::io;
use std::net::{Ipv4Addr, SocketAddrV4, UdpSocket};
use std::thread;
use std::time::Duration;

use log::{debug, warn};
use pnet::util::MacAddr;
use socket2::{Domain, Protocol, Socket, Type};
use thiserror::Error;

use crate::dhcp_forge::{forge_dhcp_discover, DhcpRequest};
use crate::dhcp_parser::{parse_options, validate_response, ProtocolError, Route};
use crate::platform;
use crate::utils::hex_dump;

pub const DHCP_CLIENT_PORT: u16 = 68;
pub const DHCP_SERVER_PORT: u16 = 67;

const RECV_TIMEOUT: Duration = Duration::from_secs(10);
const RESPONSE_BUFFER_LEN: usize = 1024;

/// Seconds to wait after each failed attempt before the next one; the first
/// retry follows immediately, and the final slot is never slept.
const WAITING_SCHEDULE: [u64; 5] = [0, 10, 30, 60, 60];

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("failed to open dhcp socket: {0}")]
    Bind(#[source] io::Error),
    #[error("failed to send dhcp request: {0}")]
    Send(#[source] io::Error),
    #[error("no dhcp response received: {0}")]
    Receive(#[source] io::Error),
}

/// Why a single attempt failed; every variant is recoverable by retrying.
#[derive(Debug, Error)]
pub enum AttemptError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("no valid dhcp response after {attempts} attempts")]
    DiscoveryFailed { attempts: usize },
}

/// What a successful discovery produced. The endpoint is the primary output;
/// gateway and routes are informational extras the server may omit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveryResult {
    pub endpoint: Option<Ipv4Addr>,
    pub gateway: Option<Ipv4Addr>,
    pub routes: Option<Vec<Route>>,
}

/// One request/response exchange. Implementations own socket lifetime and
/// timeout policy; the retry driver owns scheduling and validation.
pub trait Transport {
    fn exchange(&mut self, request: &[u8]) -> Result<Vec<u8>, TransportError>;
}

/// Broadcast UDP transport on the standard DHCP client/server ports. Each
/// exchange opens a fresh socket and closes it before returning, so a failed
/// attempt never leaks the port into the next one.
pub struct UdpBroadcastTransport {
    timeout: Duration,
}

impl UdpBroadcastTransport {
    pub fn new() -> Self {
        Self {
            timeout: RECV_TIMEOUT,
        }
    }
}

impl Default for UdpBroadcastTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl Transport for UdpBroadcastTransport {
    fn exchange(&mut self, request: &[u8]) -> Result<Vec<u8>, TransportError> {
        // Open the client port in the host firewall first, in case inbound
        // DHCP broadcast traffic is filtered. Best effort, never fatal.
        platform::allow_dhcp_broadcast();

        let socket =
            Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP)).map_err(TransportError::Bind)?;
        socket.set_reuse_address(true).map_err(TransportError::Bind)?;
        socket.set_broadcast(true).map_err(TransportError::Bind)?;
        socket
            .set_read_timeout(Some(self.timeout))
            .map_err(TransportError::Bind)?;
        let bind_addr = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, DHCP_CLIENT_PORT);
        socket.bind(&bind_addr.into()).map_err(TransportError::Bind)?;

        let socket: UdpSocket = socket.into();
        socket
            .send_to(
                request,
                SocketAddrV4::new(Ipv4Addr::BROADCAST, DHCP_SERVER_PORT),
            )
            .map_err(TransportError::Send)?;

        debug!("dhcp request sent, waiting up to {:?} for a reply", self.timeout);
        let mut buffer = [0u8; RESPONSE_BUFFER_LEN];
        let received = socket.recv(&mut buffer).map_err(TransportError::Receive)?;
        Ok(buffer[..received].to_vec())
    }
}

/// Send a DHCPDISCOVER and return the parsed reply, retrying on the fixed
/// backoff schedule. The request, including its transaction id, is forged
/// once and reused for every attempt.
pub fn send_discover<T: Transport>(
    transport: &mut T,
    mac: MacAddr,
    request_broadcast: bool,
) -> Result<DiscoveryResult, DiscoveryError> {
    let schedule = WAITING_SCHEDULE.map(Duration::from_secs);
    send_discover_with_schedule(transport, mac, request_broadcast, &schedule)
}

fn send_discover_with_schedule<T: Transport>(
    transport: &mut T,
    mac: MacAddr,
    request_broadcast: bool,
    schedule: &[Duration],
) -> Result<DiscoveryResult, DiscoveryError> {
    let request = forge_dhcp_discover(mac, request_broadcast);
    debug!("forged dhcp discover for {mac} with xid {:#010x}", request.xid());

    for (attempt, &delay) in schedule.iter().enumerate() {
        match attempt_once(transport, &request) {
            Ok(result) => return Ok(result),
            Err(e) => warn!("dhcp discovery attempt {} failed: {e}", attempt + 1),
        }
        // each slot is slept after its attempt fails; there is nothing left
        // to wait for once the last attempt is done
        if attempt + 1 < schedule.len() && !delay.is_zero() {
            thread::sleep(delay);
        }
    }

    Err(DiscoveryError::DiscoveryFailed {
        attempts: schedule.len(),
    })
}

fn attempt_once<T: Transport>(
    transport: &mut T,
    request: &DhcpRequest,
) -> Result<DiscoveryResult, AttemptError> {
    let response = transport.exchange(request.as_bytes())?;
    debug!("received {} bytes:\n{}", response.len(), hex_dump(&response));
    validate_response(request, &response)?;

    let parsed = parse_options(&response);
    Ok(DiscoveryResult {
        endpoint: parsed.endpoint,
        gateway: parsed.gateway,
        routes: parsed.routes,
    })
}
