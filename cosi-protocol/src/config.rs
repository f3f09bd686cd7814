//! Protocol names, defaults and limits

use std::time::Duration;

/// Name of the root protocol
pub const DEFAULT_PROTOCOL_NAME: &str = "blsCoSiProtoDefault";

/// Name of the per-subtree protocol
pub const DEFAULT_SUBPROTOCOL_NAME: &str = "blsSubCoSiProtoDefault";

/// Name of the key distribution protocol
pub const KEY_DISTRIBUTION_PROTOCOL_NAME: &str = "blsCoSiKeyDistribution";

/// Default global timeout of a signing round
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Smallest accepted timeout
pub const MIN_TIMEOUT: Duration = Duration::from_nanos(10);

/// How long a dispatched protocol waits for `start`
pub const START_FALLBACK: Duration = Duration::from_secs(1);

/// Sub-protocols get this fraction of the global timeout, the rest is left
/// for subleader replacement
pub const SUBPROTOCOL_TIMEOUT_DIVISOR: u32 = 4;

/// Byzantine bound `n - floor((n - 1) / 3)`
pub fn default_threshold(n: usize) -> usize {
    n - n.saturating_sub(1) / 3
}

/// `floor(sqrt(n - 1))`, at least one
pub fn default_subtrees(n: usize) -> usize {
    let non_root = n.saturating_sub(1);
    let mut k = (non_root as f64).sqrt() as usize;
    // guard against float rounding
    while k * k > non_root {
        k -= 1;
    }
    while (k + 1) * (k + 1) <= non_root {
        k += 1;
    }
    k.max(1)
}
