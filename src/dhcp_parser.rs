use std::net::Ipv4Addr;

use log::{debug, warn};
use thiserror::Error;

use crate::dhcp_forge::{DhcpRequest, OFFSET_CHADDR, OFFSET_COOKIE, OFFSET_OPTIONS, OFFSET_XID};

/// A reply must at least reach past the first option to be worth parsing.
pub const MIN_RESPONSE_LEN: usize = 0xF6;

const OPTION_ROUTER: u8 = 3;
const OPTION_ENDPOINT: u8 = 245;
const OPTION_CLASSLESS_ROUTES: u8 = 249;
const OPTION_END: u8 = 255;

/// Reasons a received datagram is rejected as a reply to our request.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("dhcp response too short: {0} bytes")]
    TooShort(usize),
    #[error("magic cookie in dhcp response does not match the request")]
    CookieMismatch,
    #[error("transaction id in dhcp response does not match the request")]
    TransactionMismatch,
    #[error("client hardware address in dhcp response does not match the request")]
    HardwareAddressMismatch,
}

/// One classless static route entry, in host byte order. The network is
/// already masked by the prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Route {
    pub network: u32,
    pub mask: u32,
    pub gateway: u32,
}

/// The fields extracted from a validated reply. A missing or malformed option
/// leaves its field `None`; it never fails the parse as a whole.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ParsedOptions {
    pub endpoint: Option<Ipv4Addr>,
    pub gateway: Option<Ipv4Addr>,
    pub routes: Option<Vec<Route>>,
}

/// Check that `response` answers `request`: same magic cookie, transaction id
/// and client hardware address at the fixed BOOTP offsets. The cookie should
/// never mismatch; the transaction id and MAC do when the reply was meant for
/// another machine.
pub fn validate_response(request: &DhcpRequest, response: &[u8]) -> Result<(), ProtocolError> {
    if response.len() < MIN_RESPONSE_LEN {
        return Err(ProtocolError::TooShort(response.len()));
    }

    let request = request.as_bytes();
    if request[OFFSET_COOKIE..OFFSET_COOKIE + 4] != response[OFFSET_COOKIE..OFFSET_COOKIE + 4] {
        return Err(ProtocolError::CookieMismatch);
    }
    if request[OFFSET_XID..OFFSET_XID + 4] != response[OFFSET_XID..OFFSET_XID + 4] {
        return Err(ProtocolError::TransactionMismatch);
    }
    if request[OFFSET_CHADDR..OFFSET_CHADDR + 6] != response[OFFSET_CHADDR..OFFSET_CHADDR + 6] {
        return Err(ProtocolError::HardwareAddressMismatch);
    }
    Ok(())
}

/// Walk the options area of a validated reply, picking out the custom
/// endpoint option (245), the default gateway (3) and classless static routes
/// (249). Everything else is skipped; the walk always advances by the
/// declared length plus two, so it terminates within the packet bounds.
pub fn parse_options(response: &[u8]) -> ParsedOptions {
    let bytes_recv = response.len();
    let mut parsed = ParsedOptions::default();

    let mut i = OFFSET_OPTIONS;
    while i < bytes_recv {
        let option = response[i];
        let length = if i + 1 < bytes_recv {
            response[i + 1] as usize
        } else {
            0
        };

        match option {
            OPTION_END => {
                debug!("dhcp options ended at offset {i:#x}");
                break;
            }
            OPTION_CLASSLESS_ROUTES => parsed.routes = parse_routes(response, i, length),
            OPTION_ROUTER => parsed.gateway = parse_ip_addr(response, option, i, length),
            OPTION_ENDPOINT => parsed.endpoint = parse_ip_addr(response, option, i, length),
            _ => debug!("skipping dhcp option {option} at {i:#x} with length {length}"),
        }
        i += length + 2;
    }

    parsed
}

fn parse_ip_addr(response: &[u8], option: u8, i: usize, length: usize) -> Option<Ipv4Addr> {
    if i + 5 >= response.len() {
        warn!("data too small for option {option}");
        return None;
    }
    if length != 4 {
        warn!("option {option} is not 4 bytes, skipping");
        return None;
    }
    Some(Ipv4Addr::new(
        response[i + 2],
        response[i + 3],
        response[i + 4],
        response[i + 5],
    ))
}

/// Option 249 packs variable-size entries: a prefix length in bits, the
/// network address trimmed to `ceil(prefix / 8)` bytes, then a full 4-byte
/// gateway. See MS-DHCPE for the layout.
fn parse_routes(response: &[u8], i: usize, length: usize) -> Option<Vec<Route>> {
    debug!("routes at offset {i:#x} with length {length:#x}");
    if length < 5 {
        warn!("data too small for option {OPTION_CLASSLESS_ROUTES}");
    }

    let end = i + 2 + length;
    let mut routes = Vec::new();
    let mut j = i + 2;
    while j < end {
        if j >= response.len() {
            warn!("route option extends past the response, dropping routes");
            return None;
        }
        let prefix = u32::from(response[j]);
        if prefix > 32 {
            warn!("route entry has prefix length {prefix}, dropping routes");
            return None;
        }
        let mask_bytes = ((prefix + 7) / 8) as usize;
        let mask = if prefix == 0 {
            0
        } else {
            u32::MAX << (32 - prefix)
        };
        j += 1;

        if j + mask_bytes + 4 > response.len() {
            warn!("truncated route entry at offset {j:#x}, dropping routes");
            return None;
        }

        let mut network: u32 = 0;
        for k in 0..mask_bytes {
            network = (network << 8) | u32::from(response[j + k]);
        }
        if mask_bytes > 0 {
            network <<= 32 - 8 * mask_bytes as u32;
        }
        network &= mask;
        j += mask_bytes;

        let gateway = u32::from_be_bytes([
            response[j],
            response[j + 1],
            response[j + 2],
            response[j + 3],
        ]);
        j += 4;

        routes.push(Route {
            network,
            mask,
            gateway,
        });
    }

    if j != end {
        warn!("route entries do not fill the declared option length");
    }
    Some(routes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dhcp_forge::forge_dhcp_discover;
    use pnet::util::MacAddr;

    const MAC: MacAddr = MacAddr(0x02, 0x00, 0x5e, 0x10, 0x20, 0x30);

    /// A minimal valid reply to `request`: echoes the cookie, transaction id
    /// and MAC at the fixed offsets and appends `options` at 0xF0.
    fn reply_to(request: &DhcpRequest, options: &[u8]) -> Vec<u8> {
        let mut response = vec![0u8; MIN_RESPONSE_LEN.max(OFFSET_OPTIONS + options.len())];
        let req = request.as_bytes();
        response[OFFSET_XID..OFFSET_XID + 4].copy_from_slice(&req[OFFSET_XID..OFFSET_XID + 4]);
        response[OFFSET_CHADDR..OFFSET_CHADDR + 6]
            .copy_from_slice(&req[OFFSET_CHADDR..OFFSET_CHADDR + 6]);
        response[OFFSET_COOKIE..OFFSET_COOKIE + 4]
            .copy_from_slice(&req[OFFSET_COOKIE..OFFSET_COOKIE + 4]);
        response[OFFSET_OPTIONS..OFFSET_OPTIONS + options.len()].copy_from_slice(options);
        response
    }

    #[test]
    fn validates_a_faithful_echo() {
        let request = forge_dhcp_discover(MAC, false);
        let response = reply_to(&request, &[255]);
        assert_eq!(validate_response(&request, &response), Ok(()));
    }

    #[test]
    fn rejects_short_responses() {
        let request = forge_dhcp_discover(MAC, false);
        let response = vec![0u8; MIN_RESPONSE_LEN - 1];
        assert_eq!(
            validate_response(&request, &response),
            Err(ProtocolError::TooShort(MIN_RESPONSE_LEN - 1))
        );
    }

    #[test]
    fn rejects_cookie_mismatch() {
        let request = forge_dhcp_discover(MAC, false);
        let mut response = reply_to(&request, &[255]);
        response[OFFSET_COOKIE] ^= 0xFF;
        assert_eq!(
            validate_response(&request, &response),
            Err(ProtocolError::CookieMismatch)
        );
    }

    #[test]
    fn rejects_transaction_id_mismatch() {
        let request = forge_dhcp_discover(MAC, false);
        let mut response = reply_to(&request, &[255]);
        response[OFFSET_XID + 2] ^= 0x01;
        assert_eq!(
            validate_response(&request, &response),
            Err(ProtocolError::TransactionMismatch)
        );
    }

    #[test]
    fn rejects_hardware_address_mismatch() {
        let request = forge_dhcp_discover(MAC, false);
        let mut response = reply_to(&request, &[255]);
        response[OFFSET_CHADDR + 5] ^= 0x01;
        assert_eq!(
            validate_response(&request, &response),
            Err(ProtocolError::HardwareAddressMismatch)
        );
    }

    #[test]
    fn other_bytes_do_not_affect_validation() {
        let request = forge_dhcp_discover(MAC, true);
        let mut response = reply_to(&request, &[255]);
        response[0] = 2; // BOOTREPLY
        response[0x10] = 10; // yiaddr
        assert_eq!(validate_response(&request, &response), Ok(()));
    }

    #[test]
    fn parses_endpoint_option() {
        let request = forge_dhcp_discover(MAC, false);
        let response = reply_to(&request, &[245, 4, 10, 0, 0, 1, 255]);

        let parsed = parse_options(&response);
        assert_eq!(parsed.endpoint, Some(Ipv4Addr::new(10, 0, 0, 1)));
        assert_eq!(parsed.gateway, None);
        assert_eq!(parsed.routes, None);
    }

    #[test]
    fn parses_gateway_and_skips_unknown_options() {
        let request = forge_dhcp_discover(MAC, false);
        let response = reply_to(
            &request,
            &[
                53, 1, 2, // message type: OFFER, ignored
                1, 4, 255, 255, 255, 0, // subnet mask, ignored
                3, 4, 192, 168, 1, 254, // router
                255,
            ],
        );

        let parsed = parse_options(&response);
        assert_eq!(parsed.gateway, Some(Ipv4Addr::new(192, 168, 1, 254)));
        assert_eq!(parsed.endpoint, None);
    }

    #[test]
    fn parses_single_classless_route() {
        let request = forge_dhcp_discover(MAC, false);
        let response = reply_to(&request, &[249, 8, 24, 10, 0, 0, 192, 168, 1, 1, 255]);

        let parsed = parse_options(&response);
        assert_eq!(
            parsed.routes,
            Some(vec![Route {
                network: 0x0A00_0000,
                mask: 0xFFFF_FF00,
                gateway: 0xC0A8_0101,
            }])
        );
    }

    #[test]
    fn parses_default_route_and_host_route() {
        let request = forge_dhcp_discover(MAC, false);
        // prefix 0 (no network bytes) then prefix 32 (full network)
        let response = reply_to(
            &request,
            &[
                249, 14, //
                0, 10, 0, 0, 1, // 0.0.0.0/0 via 10.0.0.1
                32, 172, 16, 0, 5, 10, 0, 0, 2, // 172.16.0.5/32 via 10.0.0.2
                255,
            ],
        );

        let parsed = parse_options(&response);
        assert_eq!(
            parsed.routes,
            Some(vec![
                Route {
                    network: 0,
                    mask: 0,
                    gateway: 0x0A00_0001,
                },
                Route {
                    network: 0xAC10_0005,
                    mask: 0xFFFF_FFFF,
                    gateway: 0x0A00_0002,
                },
            ])
        );
    }

    #[test]
    fn truncated_route_entry_drops_routes_but_not_other_fields() {
        let request = forge_dhcp_discover(MAC, false);
        // endpoint first, then a route option whose declared length runs past
        // the end of the buffer
        let mut options = vec![245, 4, 10, 0, 0, 1];
        options.extend_from_slice(&[249, 200, 24, 10, 0, 0]);
        let response = reply_to(&request, &options);

        let parsed = parse_options(&response);
        assert_eq!(parsed.endpoint, Some(Ipv4Addr::new(10, 0, 0, 1)));
        assert_eq!(parsed.routes, None);
    }

    #[test]
    fn wrong_length_ip_option_is_skipped() {
        let request = forge_dhcp_discover(MAC, false);
        let response = reply_to(
            &request,
            &[
                245, 6, 10, 0, 0, 1, 0, 0, // endpoint with bogus length
                3, 4, 192, 168, 1, 1, // gateway still parses
                255,
            ],
        );

        let parsed = parse_options(&response);
        assert_eq!(parsed.endpoint, None);
        assert_eq!(parsed.gateway, Some(Ipv4Addr::new(192, 168, 1, 1)));
    }

    #[test]
    fn option_length_past_buffer_does_not_panic() {
        let request = forge_dhcp_discover(MAC, false);
        // declared length runs past the response; the walk must stop safely
        let response = reply_to(&request, &[245, 4, 10, 0, 0, 1, 12, 250]);

        let parsed = parse_options(&response);
        assert_eq!(parsed.endpoint, Some(Ipv4Addr::new(10, 0, 0, 1)));
    }

    #[test]
    fn trailing_option_without_length_byte() {
        let request = forge_dhcp_discover(MAC, false);
        let mut response = reply_to(&request, &[]);
        // one extra byte so the walk lands exactly on the final byte: a lone
        // gateway tag with no room for a length or value
        response.push(3);

        let parsed = parse_options(&response);
        assert_eq!(parsed.gateway, None);
    }
}
