use std::net::SocketAddr;
use std::sync::Arc;

use super::{TransformFilter, TransformFilterFactory};
use crate::trace::{self, Level};

const HEX_DIGITS: &[u8; 16] = b"0123456789abcdef";

/// Lowercase hex rendering of every byte value.
static HEX: [[u8; 2]; 256] = {
    let mut table = [[0u8; 2]; 256];
    let mut i = 0;
    while i < 256 {
        table[i] = [HEX_DIGITS[i >> 4], HEX_DIGITS[i & 0x0f]];
        i += 1;
    }
    table
};

/// Logs every chunk passing through as hex. Leaves the data untouched.
#[derive(Debug, Clone)]
pub struct LoggingFilter {
    peer: SocketAddr,
    direction: &'static str,
    level: Level,
}

impl LoggingFilter {
    /// Creates a filter tagging its output with `peer` and `direction`.
    #[must_use]
    pub const fn new(peer: SocketAddr, direction: &'static str, level: Level) -> Self {
        Self {
            peer,
            direction,
            level,
        }
    }

    /// Factory producing a `LoggingFilter` per peer.
    #[must_use]
    pub fn factory(direction: &'static str, level: Level) -> TransformFilterFactory {
        Arc::new(move |peer: SocketAddr| {
            Box::new(Self::new(peer, direction, level)) as Box<dyn TransformFilter>
        })
    }
}

impl TransformFilter for LoggingFilter {
    fn transform(&mut self, data: &mut [u8]) -> usize {
        if self.level.enabled() {
            emit(self.level, self.peer, self.direction, &hex(data));
        }
        data.len()
    }
}

/// Renders `data` as contiguous lowercase hex.
pub(crate) fn hex(data: &[u8]) -> String {
    let mut out = Vec::with_capacity(data.len() * 2);
    for &b in data {
        out.extend_from_slice(&HEX[b as usize]);
    }
    // The table only holds ASCII digits.
    String::from_utf8(out).unwrap_or_default()
}

#[cfg_attr(not(feature = "tracing"), allow(unused_variables))]
fn emit(level: Level, peer: SocketAddr, direction: &str, hex: &str) {
    let len = hex.len() / 2;
    match level {
        Level::Trace => trace::trace!(%peer, direction, len, hex, "filter dump"),
        Level::Debug => trace::debug!(%peer, direction, len, hex, "filter dump"),
        Level::Info => trace::info!(%peer, direction, len, hex, "filter dump"),
        Level::Warn => trace::warn!(%peer, direction, len, hex, "filter dump"),
        Level::Error => trace::error!(%peer, direction, len, hex, "filter dump"),
    }
}
