//! Helper types to express memory size.

use std::{str::FromStr, sync::OnceLock};

use sysinfo::System;

/// Memory size.
///
/// # Parsing
/// This can be parsed from strings in one of the following formats:
///
/// - **absolute:** just use a non-negative number to specify the absolute
///   bytes, e.g. `1024`
/// - **binary suffix:** a number followed by `KiB`, `MiB` or `GiB`, e.g.
///   `512MiB`
/// - **relative:** use percentage between 0 and 100 (both inclusive) to
///   specify a relative amount of the totally available memory size, e.g.
///   `50%`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemorySize(usize);

impl MemorySize {
    /// Number of bytes.
    pub fn bytes(&self) -> usize {
        self.0
    }

    fn parse_with_total(s: &str, total: u64) -> Result<Self, String> {
        let s = s.trim();
        if let Some(s) = s.strip_suffix('%') {
            let percentage = u64::from_str(s.trim()).map_err(|e| e.to_string())?;
            if percentage > 100 {
                return Err(format!(
                    "relative memory size must be in [0, 100] but is {percentage}"
                ));
            }
            let bytes = total.saturating_mul(percentage) / 100;
            return Ok(Self(usize::try_from(bytes).unwrap_or(usize::MAX)));
        }

        let (number, unit) = match s.find(|c: char| !c.is_ascii_digit()) {
            Some(pos) => s.split_at(pos),
            None => (s, ""),
        };
        let shift = match unit.trim() {
            "" | "B" => 0,
            "KiB" => 10,
            "MiB" => 20,
            "GiB" => 30,
            other => return Err(format!("unknown memory size unit {other:?}")),
        };
        let number = usize::from_str(number).map_err(|e| e.to_string())?;
        number
            .checked_mul(1 << shift)
            .map(Self)
            .ok_or_else(|| format!("memory size {s:?} overflows"))
    }
}

impl std::fmt::Display for MemorySize {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for MemorySize {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse_with_total(s, total_mem_bytes())
    }
}

/// Totally available memory size in bytes.
fn total_mem_bytes() -> u64 {
    static TOTAL_MEM_BYTES: OnceLock<u64> = OnceLock::new();
    *TOTAL_MEM_BYTES.get_or_init(|| {
        let mut sys = System::new();
        sys.refresh_memory();
        sys.total_memory()
    })
}
