//! DNS front end for the replicated record store: zone-file loading, UDP
//! query answering and a JSON-over-TCP access listener.

pub mod dns;
pub mod loader;
pub mod tcp;
pub mod zone;

pub use dns::{serve_udp, DnsHandler};
pub use loader::{LoadReport, ZoneLoader};
pub use tcp::serve_tcp;
pub use zone::{parse_zone, ZoneRecord};
