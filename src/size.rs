//! Byte-size parsing with KiB/MiB/GiB suffixes.

use crate::error::BuildError;

/// Parses a byte count, accepting an optional `KiB`/`MiB`/`GiB` (or bare
/// `K`/`M`/`G`) suffix. Plain decimal strings are interpreted as bytes.
pub fn parse_size(s: &str) -> Result<u64, BuildError> {
    let s = s.trim();
    let (digits, mult) = split_suffix(s);
    digits
        .trim()
        .parse::<u64>()
        .map_err(|_| BuildError::InvalidOption {
            reason: format!("not a valid size: {s:?}"),
        })
        .map(|n| n.saturating_mul(mult))
}

fn split_suffix(s: &str) -> (&str, u64) {
    const KIB: u64 = 1024;
    const MIB: u64 = KIB * 1024;
    const GIB: u64 = MIB * 1024;
    for (suffix, mult) in [
        ("GiB", GIB),
        ("MiB", MIB),
        ("KiB", KIB),
        ("GB", GIB),
        ("MB", MIB),
        ("KB", KIB),
        ("G", GIB),
        ("M", MIB),
        ("K", KIB),
    ] {
        if let Some(rest) = s.strip_suffix(suffix) {
            return (rest, mult);
        }
    }
    (s, 1)
}
