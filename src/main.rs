use std::net::Ipv4Addr;
use std::thread;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::Parser;
use log::{info, warn};

use cloudctl::discovery::{send_discover, UdpBroadcastTransport};
use cloudctl::platform;
use cloudctl::scheduled_events::{ScheduledEventsClient, DEFAULT_ENDPOINT};
use cloudctl::store::{self, EndpointStore};

#[derive(Parser, Debug)]
#[command(name = "cloudctl")]
#[command(about = "Discover the cloud control endpoint and poll its scheduled events")]
struct Cli {
    #[command(subcommand)]
    command: Command,
    /// Enable verbose protocol logging.
    #[arg(long, global = true)]
    debug: bool,
}

#[derive(clap::Subcommand, Debug)]
enum Command {
    /// Send a DHCPDISCOVER and persist the discovered endpoint address.
    Discover(DiscoverArgs),
    /// Poll the scheduled events endpoint and optionally approve events.
    Events(EventsArgs),
}

#[derive(Parser, Debug)]
struct DiscoverArgs {
    /// Network interface to take the client hardware address from.
    #[arg(long)]
    interface: Option<String>,
    /// Ask the server to reply via broadcast instead of unicast; useful when
    /// the local dhclient cannot receive unicast replies.
    #[arg(long)]
    request_broadcast: bool,
    /// Do not add the endpoint address to the environment.
    #[arg(long)]
    no_persist: bool,
    /// Additionally store the endpoint address in the registry (Windows).
    #[arg(long)]
    registry: bool,
}

#[derive(Parser, Debug)]
struct EventsArgs {
    /// Endpoint IP address; defaults to the VNET address, then the persisted
    /// value.
    #[arg(long)]
    ip_address: Option<Ipv4Addr>,
    /// Read the persisted address from the registry (Windows).
    #[arg(long)]
    use_registry: bool,
    /// Approve pending events so the platform can start them early.
    #[arg(long)]
    approve: bool,
    /// Poll once and exit instead of watching continuously.
    #[arg(long)]
    once: bool,
    /// Seconds between polls.
    #[arg(long, default_value_t = 60)]
    interval: u64,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.debug);

    match cli.command {
        Command::Discover(args) => run_discover(args),
        Command::Events(args) => run_events(args),
    }
}

fn init_logging(debug: bool) {
    let default = if debug { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default)).init();
}

fn run_discover(args: DiscoverArgs) -> Result<()> {
    let mac = platform::source_mac(args.interface.as_deref())
        .context("no usable network interface with a hardware address")?;
    info!("sending dhcp discover from {mac}");

    let mut transport = UdpBroadcastTransport::new();
    let result = send_discover(&mut transport, mac, args.request_broadcast)?;

    let endpoint = result
        .endpoint
        .context("dhcp response did not carry the endpoint option")?;
    println!("Cloud control endpoint IP address: {endpoint}");

    if let Some(gateway) = result.gateway {
        info!("default gateway: {gateway}");
    }
    for route in result.routes.iter().flatten() {
        info!(
            "route: {}/{} via {}",
            Ipv4Addr::from(route.network),
            route.mask.count_ones(),
            Ipv4Addr::from(route.gateway)
        );
    }

    if !args.no_persist {
        info!("adding the endpoint address to the environment");
        std::env::set_var(store::ENDPOINT_KEY, endpoint.to_string());
        store::default_store()
            .set(store::ENDPOINT_KEY, &endpoint.to_string())
            .context("failed to persist the endpoint address")?;
    }

    if args.registry {
        #[cfg(windows)]
        store::RegistryStore
            .set(store::ENDPOINT_KEY, &endpoint.to_string())
            .context("failed to write the endpoint address to the registry")?;
        #[cfg(not(windows))]
        warn!("--registry is only supported on Windows, skipping");
    }

    Ok(())
}

fn run_events(args: EventsArgs) -> Result<()> {
    let client = resolve_endpoint(args.ip_address, args.use_registry)?;
    println!("Scheduled events endpoint address = {}", client.address());

    loop {
        let document = client
            .get_document()
            .context("failed to fetch the scheduled events document")?;

        if document.events.is_empty() {
            println!("No scheduled events.");
        }
        for event in &document.events {
            println!(
                "Event {}: type={} status={} resources={:?} not-before={}",
                event.event_id,
                event.event_type.as_deref().unwrap_or("-"),
                event.event_status.as_deref().unwrap_or("-"),
                event.resources,
                event.not_before.as_deref().unwrap_or("-"),
            );
        }

        if args.approve && !document.events.is_empty() {
            let ids: Vec<String> = document
                .events
                .iter()
                .map(|event| event.event_id.clone())
                .collect();
            info!("approving {} event(s)", ids.len());
            client
                .start_events(document.document_incarnation.clone(), &ids)
                .context("failed to approve scheduled events")?;
        }

        if args.once {
            return Ok(());
        }
        thread::sleep(Duration::from_secs(args.interval));
    }
}

/// Try the provided or default VNET address first, then fall back to the
/// address persisted by a previous discovery run.
fn resolve_endpoint(ip_address: Option<Ipv4Addr>, use_registry: bool) -> Result<ScheduledEventsClient> {
    let first = ip_address.unwrap_or(DEFAULT_ENDPOINT);
    let client = ScheduledEventsClient::new(first);
    if client.probe() {
        return Ok(client);
    }
    warn!("scheduled events endpoint {first} did not answer, trying the persisted address");

    let stored = stored_endpoint(use_registry)
        .context("no persisted endpoint address; run `cloudctl discover` first")?;
    let parsed: Ipv4Addr = stored
        .parse()
        .with_context(|| format!("persisted endpoint address {stored:?} is not an IPv4 address"))?;
    let client = ScheduledEventsClient::new(parsed);
    if client.probe() {
        return Ok(client);
    }
    bail!("could not find a working scheduled events endpoint; run `cloudctl discover` first")
}

fn stored_endpoint(use_registry: bool) -> Option<String> {
    #[cfg(windows)]
    if use_registry {
        if let Some(value) = store::RegistryStore.get(store::ENDPOINT_KEY) {
            return Some(value);
        }
    }
    #[cfg(not(windows))]
    let _ = use_registry;

    store::default_store().get(store::ENDPOINT_KEY)
}
