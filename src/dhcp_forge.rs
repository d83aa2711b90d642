use core::net::Ipv4Addr;
use pnet::packet::dhcp::DhcpHardwareType;
use pnet::packet::dhcp::DhcpOperation;
use pnet::packet::dhcp::MutableDhcpPacket;
use pnet::util::MacAddr;

/// Fixed size of the DHCPDISCOVER request: 236-byte BOOTP header, 4-byte
/// magic cookie, message-type option and end marker.
pub const DHCP_REQUEST_LEN: usize = 244;

pub const OFFSET_XID: usize = 0x04;
pub const OFFSET_FLAGS: usize = 0x0A;
pub const OFFSET_CHADDR: usize = 0x1C;
pub const OFFSET_COOKIE: usize = 0xEC;
pub const OFFSET_OPTIONS: usize = 0xF0;

/// A fully formed DHCPDISCOVER datagram. Immutable once forged; one instance
/// per discovery run, carrying the transaction id the reply must echo.
pub struct DhcpRequest {
    buffer: [u8; DHCP_REQUEST_LEN],
}

impl DhcpRequest {
    pub fn as_bytes(&self) -> &[u8] {
        &self.buffer
    }

    pub fn xid(&self) -> u32 {
        let b = &self.buffer;
        u32::from_be_bytes([
            b[OFFSET_XID],
            b[OFFSET_XID + 1],
            b[OFFSET_XID + 2],
            b[OFFSET_XID + 3],
        ])
    }
}

/// Build a DHCPDISCOVER request for `source_mac` with a fresh random
/// transaction id. With `request_broadcast` the broadcast flag is set so the
/// server replies to 255.255.255.255 instead of unicasting; useful when the
/// local DHCP client configuration cannot receive unicast replies.
pub fn forge_dhcp_discover(source_mac: MacAddr, request_broadcast: bool) -> DhcpRequest {
    let mut buffer = [0u8; DHCP_REQUEST_LEN];
    let mut packet = MutableDhcpPacket::new(&mut buffer).unwrap();
    packet.set_op(DhcpOperation(1));
    packet.set_htype(DhcpHardwareType(1));
    packet.set_hlen(6);
    packet.set_hops(0);
    packet.set_xid(rand::random());
    packet.set_secs(0);
    packet.set_flags(if request_broadcast { 0x8000 } else { 0 });
    packet.set_ciaddr(Ipv4Addr::new(0, 0, 0, 0));
    packet.set_yiaddr(Ipv4Addr::new(0, 0, 0, 0));
    packet.set_siaddr(Ipv4Addr::new(0, 0, 0, 0));
    packet.set_giaddr(Ipv4Addr::new(0, 0, 0, 0));
    packet.set_chaddr(source_mac);
    packet.set_chaddr_pad(&[0; 10]);
    packet.set_sname(&[0; 64]);
    packet.set_file(&[0; 128]);
    packet.set_options(&[
        0x63, 0x82, 0x53, 0x63, // Magic cookie: DHCP
        0x35, 0x01, 0x01, // Option: (53) DHCP Message Type (Discover)
        0xff, // Option: (255) End
    ]);
    drop(packet);

    DhcpRequest { buffer }
}
