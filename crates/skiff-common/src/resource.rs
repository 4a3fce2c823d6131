//! Resource quantity parsing for limit flags.
//!
//! Memory accepts plain bytes or a binary (`Ki`, `Mi`, `Gi`) or decimal
//! (`k`, `M`, `G`) suffix. CPUs accept cores (`"0.5"`, `"2"`) or
//! millicores (`"1500m"`).

use crate::error::{SkiffError, SkiffResult};

/// cgroup v2 `cpu.max` period in microseconds.
pub const CPU_PERIOD_US: u64 = 100_000;

fn invalid(value: &str) -> SkiffError {
    SkiffError::InvalidResourceQuantity {
        value: value.to_string(),
    }
}

/// Parse a memory quantity into bytes.
///
/// # Errors
///
/// Returns [`SkiffError::InvalidResourceQuantity`] for malformed or
/// overflowing input.
pub fn parse_memory(s: &str) -> SkiffResult<u64> {
    const UNITS: [(&str, u64); 7] = [
        ("Ki", 1 << 10),
        ("Mi", 1 << 20),
        ("Gi", 1 << 30),
        ("k", 1_000),
        ("K", 1_000),
        ("M", 1_000_000),
        ("G", 1_000_000_000),
    ];

    let s = s.trim();
    let (digits, multiplier) = UNITS
        .iter()
        .find_map(|(suffix, mult)| s.strip_suffix(suffix).map(|d| (d, *mult)))
        .unwrap_or((s, 1));

    digits
        .parse::<u64>()
        .ok()
        .and_then(|v| v.checked_mul(multiplier))
        .ok_or_else(|| invalid(s))
}

/// Parse a CPU quantity into millicores.
///
/// # Errors
///
/// Returns [`SkiffError::InvalidResourceQuantity`] for malformed, negative
/// or zero input.
pub fn parse_cpus(s: &str) -> SkiffResult<u64> {
    let s = s.trim();

    let millicores = if let Some(m) = s.strip_suffix('m') {
        m.parse::<u64>().map_err(|_| invalid(s))?
    } else {
        let cores: f64 = s.parse().map_err(|_| invalid(s))?;
        if !cores.is_finite() || cores < 0.0 {
            return Err(invalid(s));
        }
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let m = (cores * 1000.0).round() as u64;
        m
    };

    if millicores == 0 {
        return Err(invalid(s));
    }
    Ok(millicores)
}

/// Render a `cpu.max` line for a quota in millicores.
///
/// `None` means unlimited (`"max 100000"`).
#[must_use]
pub fn cpu_max_line(millicores: Option<u64>) -> String {
    match millicores {
        Some(m) => format!("{} {CPU_PERIOD_US}", m.saturating_mul(CPU_PERIOD_US) / 1000),
        None => format!("max {CPU_PERIOD_US}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_suffixes() {
        assert_eq!(parse_memory("1024").unwrap(), 1024);
        assert_eq!(parse_memory("512Mi").unwrap(), 512 * 1024 * 1024);
        assert_eq!(parse_memory("1Gi").unwrap(), 1 << 30);
        assert_eq!(parse_memory("128M").unwrap(), 128_000_000);
        assert_eq!(parse_memory(" 4k ").unwrap(), 4000);
    }

    #[test]
    fn memory_rejects_garbage() {
        assert!(parse_memory("").is_err());
        assert!(parse_memory("lots").is_err());
        assert!(parse_memory("-1").is_err());
        assert!(parse_memory("99999999999999999999Gi").is_err());
    }

    #[test]
    fn cpus() {
        assert_eq!(parse_cpus("1").unwrap(), 1000);
        assert_eq!(parse_cpus("0.5").unwrap(), 500);
        assert_eq!(parse_cpus("1500m").unwrap(), 1500);
        assert!(parse_cpus("0").is_err());
        assert!(parse_cpus("-2").is_err());
        assert!(parse_cpus("two").is_err());
    }

    #[test]
    fn cpu_max_lines() {
        assert_eq!(cpu_max_line(None), "max 100000");
        assert_eq!(cpu_max_line(Some(1000)), "100000 100000");
        assert_eq!(cpu_max_line(Some(2500)), "250000 100000");
        assert_eq!(cpu_max_line(Some(500)), "50000 100000");
    }
}
