//! Serial transport: port discovery plus line-framed JSON I/O

mod scanner;
mod transport;

pub use scanner::{list_candidate_ports, spawn_scanner, PortFilter, ScanConfig};
pub use transport::{SerialTransport, DEFAULT_BAUD_RATE, MAX_LINE_LENGTH};
