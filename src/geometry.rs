//! Geometry & Validator: derives every constant the rest of the
//! pipeline needs from the user-supplied [`Config`], and rejects anything
//! that doesn't add up before a single byte is written.

use crate::config::{Compression, Config};
use crate::consts::*;
use crate::error::BuildError;

fn align(x: u64, to: u64) -> u64 {
    (x + to - 1) / to * to
}

fn is_pow2(x: u32) -> bool {
    x != 0 && (x & (x - 1)) == 0
}

/// Everything downstream components need, computed once and passed around
/// immutably rather than recomputed piecemeal by each stage.
#[derive(Debug, Clone)]
pub struct Geometry {
    pub min_io_size: u32,
    pub leb_size: u32,
    pub max_leb_cnt: u32,
    pub fanout: u32,
    pub max_bud_bytes: u64,
    pub log_lebs: u32,
    pub orph_lebs: u32,
    pub rp_size: u64,

    pub jhead_cnt: u32,
    pub min_log_lebs: u32,
    pub max_idx_node_sz: u32,
    pub dead_wm: u32,
    pub dark_wm: u32,

    pub big_lpt: bool,
    pub lpt_lebs: u32,

    pub main_first: u32,

    pub fmt_version: u32,
    pub compr: Compression,
    pub double_hash: bool,
    pub encryption: bool,
    pub authentication: bool,
}

impl Geometry {
    pub fn derive(config: &Config) -> Result<Geometry, BuildError> {
        let min_io_size = config.min_io_size;
        let leb_size = config.leb_size;
        let fanout = config.fanout;

        if min_io_size < 8 {
            return Err(BuildError::InvalidGeometry {
                reason: format!("min_io_size {min_io_size} is below the minimum of 8"),
            });
        }
        if !is_pow2(min_io_size) {
            return Err(BuildError::InvalidGeometry {
                reason: format!("min_io_size {min_io_size} is not a power of two"),
            });
        }
        if leb_size < UBIFS_MIN_LEB_SZ || leb_size > UBIFS_MAX_LEB_SZ {
            return Err(BuildError::InvalidGeometry {
                reason: format!(
                    "leb_size {leb_size} out of range [{UBIFS_MIN_LEB_SZ}, {UBIFS_MAX_LEB_SZ}]"
                ),
            });
        }
        if leb_size % min_io_size != 0 {
            return Err(BuildError::InvalidGeometry {
                reason: format!("leb_size {leb_size} is not a multiple of min_io_size {min_io_size}"),
            });
        }
        if leb_size % 8 != 0 {
            return Err(BuildError::InvalidGeometry {
                reason: format!("leb_size {leb_size} is not a multiple of 8"),
            });
        }

        let max_fanout = (leb_size - IDX_NODE_SZ) / (BRANCH_SZ + UBIFS_MAX_KEY_LEN);
        if fanout < UBIFS_MIN_FANOUT || fanout > max_fanout {
            return Err(BuildError::InvalidGeometry {
                reason: format!(
                    "fanout {fanout} out of range [{UBIFS_MIN_FANOUT}, {max_fanout}]"
                ),
            });
        }

        let jhead_cnt = 1u32;

        let max_bud_bytes = config.jrn_size.unwrap_or_else(|| {
            let default = leb_size as u64 / 8; // ~12.5% of a single LEB's worth scaled by usage below
            default
        });
        let max_bud_bytes = clamp_jrn_size(max_bud_bytes, leb_size);

        let buds = (max_bud_bytes.div_ceil(leb_size as u64)).max(1) as u32;
        let min_log_lebs = {
            let a = align(
                (buds as u64) * align(REF_NODE_SZ as u64, min_io_size as u64),
                1,
            ) + align(
                (CS_NODE_SZ + REF_NODE_SZ * (jhead_cnt + 2)) as u64,
                min_io_size as u64,
            );
            (a.div_ceil(leb_size as u64)) as u32 + 1
        };

        let log_lebs = config.log_lebs.unwrap_or(min_log_lebs + 2);
        if log_lebs < min_log_lebs {
            return Err(BuildError::InvalidGeometry {
                reason: format!("log_lebs {log_lebs} is fewer than the minimum {min_log_lebs}"),
            });
        }
        if log_lebs > config.max_leb_cnt / 2 {
            return Err(BuildError::InvalidGeometry {
                reason: format!("log_lebs {log_lebs} is implausibly large for max_leb_cnt {}", config.max_leb_cnt),
            });
        }

        let orph_lebs = config.orph_lebs;
        if orph_lebs < 1 {
            return Err(BuildError::InvalidGeometry {
                reason: "orph_lebs must be at least 1".into(),
            });
        }
        if orph_lebs > config.max_leb_cnt / 2 {
            return Err(BuildError::InvalidGeometry {
                reason: format!("orph_lebs {orph_lebs} is implausibly large for max_leb_cnt {}", config.max_leb_cnt),
            });
        }

        let max_idx_node_sz = IDX_NODE_SZ + fanout * (BRANCH_SZ + UBIFS_MAX_KEY_LEN);
        let dead_wm = align(MIN_WRITE_SZ as u64, min_io_size as u64) as u32;
        let dark_wm = align(MAX_NODE_SZ as u64, min_io_size as u64) as u32;

        let mut rp_size = config.reserved;
        rp_size = add_space_overhead(rp_size, max_idx_node_sz, fanout);
        if rp_size >= (leb_size as u64 * config.max_leb_cnt as u64) / 2 {
            return Err(BuildError::InvalidGeometry {
                reason: format!(
                    "reserved space {rp_size} is at least half the volume capacity"
                ),
            });
        }

        let (big_lpt, lpt_lebs) =
            crate::lpt::lpt_geometry(config.max_leb_cnt, leb_size, min_io_size);

        let encryption = config.encryption.is_some();
        let authentication = config.authentication.is_some();
        let double_hash = config.double_hash();

        let min_needed = UBIFS_SB_LEBS + UBIFS_MST_LEBS + log_lebs + lpt_lebs + orph_lebs + 4;
        if config.max_leb_cnt < min_needed {
            return Err(BuildError::InvalidGeometry {
                reason: format!(
                    "max_leb_cnt {} is insufficient to hold SB+MST+log+lpt+orph+4 ({min_needed})",
                    config.max_leb_cnt
                ),
            });
        }

        let main_first = UBIFS_SB_LEBS + UBIFS_MST_LEBS + log_lebs + lpt_lebs + orph_lebs;

        let fmt_version = if double_hash || encryption { 5 } else { 4 };

        let compr = if encryption {
            Compression::None
        } else {
            resolve_compr(config.compr)
        };

        Ok(Geometry {
            min_io_size,
            leb_size,
            max_leb_cnt: config.max_leb_cnt,
            fanout,
            max_bud_bytes,
            log_lebs,
            orph_lebs,
            rp_size,
            jhead_cnt,
            min_log_lebs,
            max_idx_node_sz,
            dead_wm,
            dark_wm,
            big_lpt,
            lpt_lebs,
            main_first,
            fmt_version,
            compr,
            double_hash,
            encryption,
            authentication,
        })
    }
}

/// Falls back from `requested` to the first backend actually compiled in
/// (LZO, then zlib, then none) instead of handing the rest of the
/// pipeline a compression type with no backend to run it.
fn resolve_compr(requested: Compression) -> Compression {
    let available = match requested {
        Compression::None => true,
        Compression::Lzo | Compression::FavorLzo => cfg!(feature = "lzo"),
        Compression::Zlib => cfg!(feature = "zlib"),
        Compression::Zstd => cfg!(feature = "zstd-support"),
    };
    if available {
        return requested;
    }
    if cfg!(feature = "lzo") {
        Compression::Lzo
    } else if cfg!(feature = "zlib") {
        Compression::Zlib
    } else {
        Compression::None
    }
}

fn clamp_jrn_size(requested: u64, leb_size: u32) -> u64 {
    let min = 4 * leb_size as u64;
    let max = 8 * 1024 * 1024;
    requested.clamp(min, max.max(min))
}

/// `rp_size` overhead bump: accounts for the worst-case
/// per-reserved-byte index/data-node amplification.
fn add_space_overhead(rp_size: u64, max_idx_node_sz: u32, fanout: u32) -> u64 {
    if rp_size == 0 {
        return 0;
    }
    let divisor = (fanout >> 1).max(2) as u64;
    let factor = MAX_DATA_NODE_SZ as u64 + 3 * max_idx_node_sz as u64 / divisor - 1;
    let overhead = rp_size * factor / BLOCK_SIZE;
    rp_size + overhead
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_config() -> Config {
        Config {
            min_io_size: 2048,
            leb_size: 126976,
            max_leb_cnt: 100,
            fanout: 8,
            ..Default::default()
        }
    }

    #[test]
    fn valid_geometry_derives() {
        let cfg = base_config();
        let geo = Geometry::derive(&cfg).unwrap();
        assert_eq!(geo.fmt_version, 4);
        assert!(geo.main_first > 0);
    }

    #[test]
    fn rejects_non_power_of_two_min_io() {
        let mut cfg = base_config();
        cfg.min_io_size = 1000;
        assert!(matches!(
            Geometry::derive(&cfg),
            Err(BuildError::InvalidGeometry { .. })
        ));
    }

    #[test]
    fn rejects_leb_size_not_multiple_of_min_io() {
        let mut cfg = base_config();
        cfg.leb_size = 126977;
        assert!(Geometry::derive(&cfg).is_err());
    }

    #[test]
    fn rejects_excessive_fanout() {
        let mut cfg = base_config();
        cfg.fanout = 100_000;
        assert!(Geometry::derive(&cfg).is_err());
    }

    #[test]
    fn rejects_too_small_max_leb_cnt() {
        let mut cfg = base_config();
        cfg.max_leb_cnt = 4;
        assert!(Geometry::derive(&cfg).is_err());
    }

    #[test]
    fn encryption_forces_double_hash_and_fmt5() {
        let mut cfg = base_config();
        cfg.encryption = Some(crate::config::EncryptionConfig {
            key_file: "/dev/null".into(),
            key_desc: "test".into(),
            cipher: crate::config::Cipher::Aes256Xts,
            padding: 16,
        });
        let geo = Geometry::derive(&cfg).unwrap();
        assert!(geo.double_hash);
        assert_eq!(geo.fmt_version, 5);
        assert_eq!(geo.compr, Compression::None);
    }
}
