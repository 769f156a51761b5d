//! Hash rate type for expressing delivered and contracted hashing power.

/// Hashing rate in hashes per second.
///
/// Used both for the rate a contract promises and for the rate estimated
/// from accepted shares. Estimates are statistical: they extrapolate from
/// the work a share represents, not from counting actual hash attempts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct HashRate(u64);

impl HashRate {
    /// No measurable hashing.
    pub const ZERO: HashRate = HashRate(0);

    /// Create a rate of N hashes per second.
    pub const fn from_hashes_per_second(hashes: u64) -> Self {
        Self(hashes)
    }

    /// Create a rate of N terahashes per second.
    pub const fn from_terahashes(th: u64) -> Self {
        Self(th.saturating_mul(1_000_000_000_000))
    }

    /// Get the rate as hashes per second.
    pub const fn as_hashes_per_second(&self) -> u64 {
        self.0
    }

    pub const fn is_zero(&self) -> bool {
        self.0 == 0
    }
}

impl std::fmt::Display for HashRate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        const UNITS: [&str; 7] = ["H/s", "KH/s", "MH/s", "GH/s", "TH/s", "PH/s", "EH/s"];

        let mut value = self.0 as f64;
        let mut unit = 0;
        while value >= 1000.0 && unit < UNITS.len() - 1 {
            value /= 1000.0;
            unit += 1;
        }

        if unit == 0 {
            write!(f, "{} {}", self.0, UNITS[0])
        } else {
            write!(f, "{:.2} {}", value, UNITS[unit])
        }
    }
}
