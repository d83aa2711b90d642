pub mod dhcp_forge;
pub mod dhcp_parser;
pub mod discovery;
pub mod platform;
pub mod scheduled_events;
pub mod store;
pub mod utils;
