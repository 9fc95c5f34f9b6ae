//! Text configuration format: memory size, preload images, and disk
//! inventory. Parses into a typed [`Config`]; building the device objects it
//! describes is left to the consumer.

use crate::error::Error;

/// A `segment:offset` pair naming where a preload image lands in real-mode
/// addressing (not a linear address — the consumer computes that).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegOffset {
    pub segment: u16,
    pub offset: u16,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Preload {
    pub at: SegOffset,
    pub path: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FixedDisk {
    pub index: u32,
    pub path: String,
    pub size_kib: u32,
}

/// Canonical floppy geometry, keyed by the config's type tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FloppyGeometry {
    pub cylinders: u16,
    pub heads: u16,
    pub sectors_per_track: u16,
}

impl FloppyGeometry {
    /// Looks up the fixed geometry for one of the six documented type tags.
    pub fn for_tag(tag: &str) -> Option<FloppyGeometry> {
        Some(match tag {
            "160kB" => FloppyGeometry { cylinders: 40, heads: 1, sectors_per_track: 8 },
            "320kB" => FloppyGeometry { cylinders: 40, heads: 2, sectors_per_track: 8 },
            "360kB" => FloppyGeometry { cylinders: 40, heads: 2, sectors_per_track: 9 },
            "720kB" => FloppyGeometry { cylinders: 80, heads: 2, sectors_per_track: 9 },
            "1.2M" => FloppyGeometry { cylinders: 80, heads: 2, sectors_per_track: 15 },
            "1.44M" => FloppyGeometry { cylinders: 80, heads: 2, sectors_per_track: 18 },
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Floppy {
    pub index: u32,
    pub type_tag: String,
    pub path: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Config {
    pub memory_kib: u32,
    pub preloads: Vec<Preload>,
    pub fixed_disks: Vec<FixedDisk>,
    pub floppies: Vec<Floppy>,
    pub initial_cs_eip: Option<(u16, u32)>,
}

fn parse_seg_offset(text: &str) -> Result<SegOffset, Error> {
    let (seg, off) = text
        .split_once(':')
        .ok_or_else(|| Error::Config(format!("expected segment:offset, got {text:?}")))?;
    let segment = u16::from_str_radix(seg.trim_start_matches("0x"), 16)
        .map_err(|_| Error::Config(format!("bad segment {seg:?}")))?;
    let offset = u16::from_str_radix(off.trim_start_matches("0x"), 16)
        .map_err(|_| Error::Config(format!("bad offset {off:?}")))?;
    Ok(SegOffset { segment, offset })
}

/// Parses the line-oriented config format: `#`-comments, blank lines
/// skipped, and one command per remaining line. Unknown commands are an
/// error rather than silently ignored.
pub fn parse(text: &str) -> Result<Config, Error> {
    let mut config = Config::default();

    for (lineno, raw_line) in text.lines().enumerate() {
        let line = raw_line.split('#').next().unwrap_or("").trim();
        if line.is_empty() {
            continue;
        }
        let mut parts = line.split_whitespace();
        let command = parts.next().unwrap();
        let rest: Vec<&str> = parts.collect();
        let err = |msg: String| Error::Config(format!("line {}: {}", lineno + 1, msg));

        match command {
            "memory" => {
                let kib = rest
                    .first()
                    .ok_or_else(|| err("memory requires a KiB count".into()))?;
                config.memory_kib = kib.parse().map_err(|_| err(format!("bad memory size {kib:?}")))?;
            }
            "preload" => {
                let at = rest.first().ok_or_else(|| err("preload requires segment:offset".into()))?;
                let path = rest.get(1).ok_or_else(|| err("preload requires a path".into()))?;
                config.preloads.push(Preload {
                    at: parse_seg_offset(at).map_err(|e| err(e.to_string()))?,
                    path: path.to_string(),
                });
            }
            "fixed-disk" => {
                let index = rest.first().ok_or_else(|| err("fixed-disk requires an index".into()))?;
                let path = rest.get(1).ok_or_else(|| err("fixed-disk requires a path".into()))?;
                let size_kib = rest.get(2).ok_or_else(|| err("fixed-disk requires a size in KiB".into()))?;
                config.fixed_disks.push(FixedDisk {
                    index: index.parse().map_err(|_| err(format!("bad index {index:?}")))?,
                    path: path.to_string(),
                    size_kib: size_kib.parse().map_err(|_| err(format!("bad size {size_kib:?}")))?,
                });
            }
            "floppy" => {
                let index = rest.first().ok_or_else(|| err("floppy requires an index".into()))?;
                let type_tag = rest.get(1).ok_or_else(|| err("floppy requires a type tag".into()))?;
                let path = rest.get(2).ok_or_else(|| err("floppy requires a path".into()))?;
                if FloppyGeometry::for_tag(type_tag).is_none() {
                    return Err(err(format!("unknown floppy type tag {type_tag:?}")));
                }
                config.floppies.push(Floppy {
                    index: index.parse().map_err(|_| err(format!("bad index {index:?}")))?,
                    type_tag: type_tag.to_string(),
                    path: path.to_string(),
                });
            }
            "start" => {
                let at = rest.first().ok_or_else(|| err("start requires segment:offset".into()))?;
                let so = parse_seg_offset(at).map_err(|e| err(e.to_string()))?;
                config.initial_cs_eip = Some((so.segment, so.offset as u32));
            }
            other => return Err(err(format!("unknown command {other:?}"))),
        }
    }

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_memory_and_preload_and_comments() {
        let cfg = parse(
            "# a leading comment\n\
             memory 640\n\
             preload 1000:0000 boot.bin\n",
        )
        .unwrap();
        assert_eq!(cfg.memory_kib, 640);
        assert_eq!(cfg.preloads.len(), 1);
        assert_eq!(cfg.preloads[0].at, SegOffset { segment: 0x1000, offset: 0 });
        assert_eq!(cfg.preloads[0].path, "boot.bin");
    }

    #[test]
    fn rejects_unknown_floppy_type_tag() {
        let err = parse("floppy 0 2.88M a.img\n").unwrap_err();
        assert!(err.to_string().contains("unknown floppy type tag"));
    }

    #[test]
    fn rejects_unknown_command() {
        let err = parse("frobnicate\n").unwrap_err();
        assert!(err.to_string().contains("unknown command"));
    }

    #[test]
    fn accepts_all_six_floppy_geometries() {
        for tag in ["160kB", "320kB", "360kB", "720kB", "1.2M", "1.44M"] {
            assert!(FloppyGeometry::for_tag(tag).is_some(), "{tag} should be recognized");
        }
    }
}
