use log::debug;
use pnet::datalink::{self, NetworkInterface};
use pnet::util::MacAddr;

/// Pick the hardware address the discover packet is forged with. With `name`
/// the matching interface is used; otherwise the first interface that is up,
/// not loopback and carries a real MAC.
pub fn source_mac(name: Option<&str>) -> Option<MacAddr> {
    let interfaces = datalink::interfaces();
    let interface: Option<NetworkInterface> = match name {
        Some(name) => interfaces.into_iter().find(|iface| iface.name == name),
        None => interfaces
            .into_iter()
            .find(|iface| iface.is_up() && !iface.is_loopback() && has_mac(iface)),
    };

    let interface = interface?;
    debug!("using interface {} for the client hardware address", interface.name);
    interface.mac.filter(|mac| *mac != MacAddr::zero())
}

fn has_mac(interface: &NetworkInterface) -> bool {
    matches!(interface.mac, Some(mac) if mac != MacAddr::zero())
}

/// Open the DHCP client port if iptables is enabled. The rule is deleted
/// first so repeated attempts don't stack duplicates. Errors (no iptables,
/// no privileges) are suppressed.
#[cfg(target_os = "linux")]
pub fn allow_dhcp_broadcast() {
    run_quiet(
        "iptables",
        &["-D", "INPUT", "-p", "udp", "--dport", "68", "-j", "ACCEPT"],
    );
    run_quiet(
        "iptables",
        &["-I", "INPUT", "-p", "udp", "--dport", "68", "-j", "ACCEPT"],
    );
}

#[cfg(not(target_os = "linux"))]
pub fn allow_dhcp_broadcast() {}

#[cfg(target_os = "linux")]
fn run_quiet(command: &str, args: &[&str]) {
    use std::process::Command;

    match Command::new(command).args(args).output() {
        Ok(output) if !output.status.success() => {
            debug!("{command} exited with {}", output.status)
        }
        Err(e) => debug!("could not run {command}: {e}"),
        Ok(_) => {}
    }
}
