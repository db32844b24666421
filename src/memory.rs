//! Memory size parsing and resident-set-size queries.
//!
//! The `--max-memory-size` argument accepts a plain integer (MiB) or a
//! human-readable size such as "4G" or "2048M".

#![allow(dead_code)] // Some constructors are only used in tests

use std::fmt;
use std::str::FromStr;

/// Memory size in bytes with parsing and formatting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct MemorySize(u64);

impl MemorySize {
    /// Create from raw bytes.
    pub const fn from_bytes(bytes: u64) -> Self {
        Self(bytes)
    }

    /// Create from mebibytes (MiB).
    pub const fn from_mib(mib: u64) -> Self {
        Self(mib * 1024 * 1024)
    }

    /// Create from gibibytes (GiB).
    pub const fn from_gib(gib: u64) -> Self {
        Self(gib * 1024 * 1024 * 1024)
    }

    /// Get the raw byte count.
    pub const fn as_bytes(&self) -> u64 {
        self.0
    }

    /// Get the size in kibibytes (KiB), truncated.
    pub const fn as_kib(&self) -> u64 {
        self.0 / 1024
    }

    /// Get the size in mebibytes (MiB), truncated.
    pub const fn as_mib(&self) -> u64 {
        self.0 / (1024 * 1024)
    }
}

impl fmt::Display for MemorySize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const GIB: u64 = 1024 * 1024 * 1024;
        const MIB: u64 = 1024 * 1024;
        if self.0 >= GIB && self.0 % GIB == 0 {
            write!(f, "{}GiB", self.0 / GIB)
        } else if self.0 % MIB == 0 {
            write!(f, "{}MiB", self.0 / MIB)
        } else {
            write!(f, "{}B", self.0)
        }
    }
}

/// Error parsing a memory size string.
#[derive(Debug, Clone)]
pub struct MemorySizeError(String);

impl fmt::Display for MemorySizeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid memory size: {}", self.0)
    }
}

impl std::error::Error for MemorySizeError {}

impl FromStr for MemorySize {
    type Err = MemorySizeError;

    /// Parse a human-readable memory size string.
    ///
    /// A plain number is treated as MiB; otherwise a `K`/`M`/`G` suffix
    /// (optionally `iB`/`B`) selects the unit. Case insensitive.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err(MemorySizeError("empty string".into()));
        }

        let lower = s.to_lowercase();
        let (digits, unit): (&str, u64) = if let Some(n) = strip_unit(&lower, "g") {
            (n, 1024 * 1024 * 1024)
        } else if let Some(n) = strip_unit(&lower, "m") {
            (n, 1024 * 1024)
        } else if let Some(n) = strip_unit(&lower, "k") {
            (n, 1024)
        } else {
            // Bare numbers are MiB.
            (lower.as_str(), 1024 * 1024)
        };

        let value: u64 = digits
            .trim()
            .parse()
            .map_err(|_| MemorySizeError(format!("'{}'", s)))?;
        Ok(Self(value * unit))
    }
}

/// Strip a `g`/`gb`/`gib`-style suffix, returning the numeric part.
fn strip_unit<'a>(s: &'a str, unit: &str) -> Option<&'a str> {
    for suffix in [format!("{unit}ib"), format!("{unit}b"), unit.to_string()] {
        if let Some(n) = s.strip_suffix(&suffix) {
            return Some(n);
        }
    }
    None
}

/// Maximum resident set size of this process so far, in KiB.
///
/// getrusage reports max RSS in KiB on Linux and in bytes on macOS.
pub fn max_rss_kib() -> u64 {
    use nix::sys::resource::{UsageWho, getrusage};

    match getrusage(UsageWho::RUSAGE_SELF) {
        Ok(usage) => {
            let max_rss = usage.max_rss().max(0) as u64;

            #[cfg(target_os = "macos")]
            {
                max_rss / 1024
            }

            #[cfg(not(target_os = "macos"))]
            {
                max_rss
            }
        }
        Err(_) => 0,
    }
}
