use std::net::TcpListener;
use std::ops::RangeInclusive;

pub const DEFAULT_PORT_RANGE: RangeInclusive<u16> = 7860..=8000;

/// First port in `range` that `host` can bind, or the range start when none can.
///
/// The probe listener is closed before returning, so another process may
/// still take the port before the server binds it.
pub fn find_available_port(host: &str, range: RangeInclusive<u16>) -> u16 {
    let start = *range.start();
    for port in range {
        match TcpListener::bind((host, port)) {
            Ok(_) => return port,
            Err(err) => tracing::trace!(port, error = %err, "port unavailable"),
        }
    }
    tracing::warn!(port = start, "no free port in range; falling back to range start");
    start
}
