//! Configuration for the block-management core, parsed from the
//! line-oriented `Key=Value` file named in spec.md §6.
//!
//! Layered the way the teacher's `config.rs` layers defaults plus
//! hierarchical structs, but the source format here is the plugin's own
//! `bluegene.conf`-equivalent, not TOML/JSON.

use std::collections::HashMap;

use crate::block::{ConnType, Images};
use crate::common::Dimensions;
use crate::error::{CoreError, Result};
use crate::topology::DenyPass;

/// Baseline hardware constants used when a config key is absent.
mod defaults {
    pub const BASE_PARTITION_NODE_CNT: u32 = 512;
    pub const NODE_CARD_NODE_CNT: u32 = 32;
    pub const NUMPSETS: u32 = 8;
    // numpsets / bp_node_cnt: one ionode per 64 compute nodes, which is
    // what makes the 32-node nodecard the smallest legal small block below.
    pub const IO_RATIO: f64 = 0.015_625;
    pub const CPUS_PER_NODE: u32 = 4;
}

/// Allocator strategy, fixed for the process lifetime (spec.md §4.5).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum LayoutMode {
    #[default]
    Static,
    Overlap,
    Dynamic,
}

impl LayoutMode {
    fn parse(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "static" => Ok(Self::Static),
            "overlap" => Ok(Self::Overlap),
            "dynamic" => Ok(Self::Dynamic),
            other => Err(CoreError::ConfigInvalid(format!("unknown LayoutMode: {other}"))),
        }
    }
}

/// A statically (or overlap-) configured block, parsed from one `BPs=` line.
#[derive(Clone, Debug)]
pub struct StaticBlockSpec {
    pub nodes_range: String,
    pub conn_type: ConnType,
    pub small_block_cnt: HashMap<u32, u32>,
}

/// Root configuration, assembled from `read_config`.
#[derive(Clone, Debug)]
pub struct Config {
    pub layout_mode: LayoutMode,
    pub bp_node_cnt: u32,
    pub nodecard_node_cnt: u32,
    pub numpsets: u32,
    pub io_ratio: f64,
    pub cpus_per_node: u32,
    pub deny_passthrough: DenyPass,
    pub dims: Dimensions,
    pub legacy_small_blocks: bool,
    pub default_images: Images,
    pub alt_images: Vec<Images>,
    pub static_blocks: Vec<StaticBlockSpec>,
    pub state_save_location: String,
    pub bridge_api_log_file: Option<String>,
    pub bridge_api_verbose: u16,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            layout_mode: LayoutMode::default(),
            bp_node_cnt: defaults::BASE_PARTITION_NODE_CNT,
            nodecard_node_cnt: defaults::NODE_CARD_NODE_CNT,
            numpsets: defaults::NUMPSETS,
            io_ratio: defaults::IO_RATIO,
            cpus_per_node: defaults::CPUS_PER_NODE,
            deny_passthrough: DenyPass::None,
            dims: Dimensions::new(1, 1, 1),
            legacy_small_blocks: false,
            default_images: Images::default(),
            alt_images: Vec::new(),
            static_blocks: Vec::new(),
            state_save_location: "/var/spool/blockmgr".to_string(),
            bridge_api_log_file: None,
            bridge_api_verbose: 0,
        }
    }
}

impl Config {
    /// Parses a `bluegene.conf`-style `Key=Value` file. Malformed content
    /// (unknown `LayoutMode`, bad `DenyPassthrough` token) is fatal, per
    /// spec.md §7's `CONFIG_INVALID` row.
    pub fn parse(text: &str) -> Result<Self> {
        let mut cfg = Self::default();
        for (lineno, raw_line) in text.lines().enumerate() {
            let line = raw_line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let Some((key, value)) = line.split_once('=') else {
                return Err(CoreError::ConfigInvalid(format!(
                    "line {}: expected Key=Value",
                    lineno + 1
                )));
            };
            cfg.apply(key.trim(), value.trim())?;
        }
        Ok(cfg)
    }

    fn apply(&mut self, key: &str, value: &str) -> Result<()> {
        match key {
            "LayoutMode" => self.layout_mode = LayoutMode::parse(value)?,
            "BasePartitionNodeCnt" => self.bp_node_cnt = parse_u32(value)?,
            "NodeCardNodeCnt" => self.nodecard_node_cnt = parse_u32(value)?,
            "Numpsets" => self.numpsets = parse_u32(value)?,
            "DenyPassthrough" => self.deny_passthrough = parse_deny_pass(value)?,
            "MloaderImage" => self.default_images.mloader = value.to_string(),
            "CnloadImage" | "LinuxImage" => self.default_images.cnload = value.to_string(),
            "IoloadImage" | "RamDiskImage" => self.default_images.ioload = value.to_string(),
            "BlrtsImage" => self.default_images.blrts = value.to_string(),
            "AltMloaderImage" | "AltCnloadImage" | "AltLinuxImage" | "AltIoloadImage"
            | "AltRamDiskImage" | "AltBlrtsImage" => self.push_alt_image(key, value),
            "BridgeAPILogFile" => self.bridge_api_log_file = Some(value.to_string()),
            "BridgeAPIVerbose" => self.bridge_api_verbose = parse_u16(value)?,
            "StateSaveLocation" => self.state_save_location = value.to_string(),
            "LegacySmallBlocks" => self.legacy_small_blocks = parse_bool(value)?,
            "Dimensions" => self.dims = parse_dims(value)?,
            "BPs" => self.static_blocks.push(parse_bp_line(value)?),
            other => {
                return Err(CoreError::ConfigInvalid(format!("unknown configuration key: {other}")))
            }
        }
        Ok(())
    }

    fn push_alt_image(&mut self, key: &str, value: &str) {
        if self.alt_images.is_empty() {
            self.alt_images.push(Images::default());
        }
        let Some(img) = self.alt_images.last_mut() else { return };
        match key {
            "AltMloaderImage" => img.mloader = value.to_string(),
            "AltCnloadImage" | "AltLinuxImage" => img.cnload = value.to_string(),
            "AltIoloadImage" | "AltRamDiskImage" => img.ioload = value.to_string(),
            "AltBlrtsImage" => img.blrts = value.to_string(),
            _ => {}
        }
    }

    /// Derives the smallest legal small-block size from the I/O ratio, per
    /// spec.md §4.1.
    pub fn smallest_block_size(&self) -> u32 {
        crate::topology::ValidSmallRanges::smallest_block_size(
            self.bp_node_cnt,
            self.io_ratio,
            self.numpsets,
            self.nodecard_node_cnt,
        )
    }

    pub fn ionodes_per_midplane(&self) -> u32 {
        self.numpsets
    }
}

fn parse_u32(v: &str) -> Result<u32> {
    v.parse().map_err(|_| CoreError::ConfigInvalid(format!("expected integer, got '{v}'")))
}

fn parse_u16(v: &str) -> Result<u16> {
    v.parse().map_err(|_| CoreError::ConfigInvalid(format!("expected integer, got '{v}'")))
}

fn parse_bool(v: &str) -> Result<bool> {
    match v.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" => Ok(true),
        "0" | "false" | "no" => Ok(false),
        other => Err(CoreError::ConfigInvalid(format!("expected boolean, got '{other}'"))),
    }
}

fn parse_dims(v: &str) -> Result<Dimensions> {
    let parts: Vec<&str> = v.split(['x', 'X', ',']).collect();
    if parts.len() != 3 {
        return Err(CoreError::ConfigInvalid(format!("expected DxDxD dimensions, got '{v}'")));
    }
    let x = parse_u32(parts[0].trim())? as u16;
    let y = parse_u32(parts[1].trim())? as u16;
    let z = parse_u32(parts[2].trim())? as u16;
    Ok(Dimensions::new(x, y, z))
}

fn parse_deny_pass(v: &str) -> Result<DenyPass> {
    match v.to_ascii_uppercase().as_str() {
        "" | "NONE" => Ok(DenyPass::None),
        "X" => Ok(DenyPass::X),
        "Y" => Ok(DenyPass::Y),
        "Z" => Ok(DenyPass::Z),
        "ALL" => Ok(DenyPass::All),
        other => Err(CoreError::ConfigInvalid(format!("unknown DenyPassthrough token: {other}"))),
    }
}

/// Parses one `BPs=Nodes=<rng> Type=<conn> 32CNBlockCnt=N …` line.
fn parse_bp_line(v: &str) -> Result<StaticBlockSpec> {
    let mut nodes_range = String::new();
    let mut conn_type = ConnType::Torus;
    let mut small_block_cnt = HashMap::new();
    for field in v.split_whitespace() {
        let Some((k, val)) = field.split_once('=') else {
            return Err(CoreError::ConfigInvalid(format!("malformed BPs field: '{field}'")));
        };
        match k {
            "Nodes" => nodes_range = val.to_string(),
            "Type" => {
                conn_type = match val.to_ascii_lowercase().as_str() {
                    "mesh" => ConnType::Mesh,
                    "torus" => ConnType::Torus,
                    "small" => ConnType::Small,
                    other => {
                        return Err(CoreError::ConfigInvalid(format!("unknown block Type: {other}")))
                    }
                };
            }
            other if other.ends_with("CNBlockCnt") => {
                let size: u32 = other
                    .trim_end_matches("CNBlockCnt")
                    .parse()
                    .map_err(|_| CoreError::ConfigInvalid(format!("malformed size in '{other}'")))?;
                small_block_cnt.insert(size, parse_u32(val)?);
            }
            other => return Err(CoreError::ConfigInvalid(format!("unknown BPs field: {other}"))),
        }
    }
    if nodes_range.is_empty() {
        return Err(CoreError::ConfigInvalid("BPs line missing Nodes=".to_string()));
    }
    Ok(StaticBlockSpec { nodes_range, conn_type, small_block_cnt })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_layout_mode_and_images() {
        let cfg = Config::parse(
            "LayoutMode=dynamic\nMloaderImage=mloader-default\nDimensions=4x4x4\n",
        )
        .unwrap();
        assert_eq!(cfg.layout_mode, LayoutMode::Dynamic);
        assert_eq!(cfg.default_images.mloader, "mloader-default");
        assert_eq!(cfg.dims, Dimensions::new(4, 4, 4));
    }

    #[test]
    fn rejects_unknown_layout_mode() {
        let err = Config::parse("LayoutMode=bogus\n").unwrap_err();
        assert!(matches!(err, CoreError::ConfigInvalid(_)));
    }

    #[test]
    fn rejects_lines_without_equals() {
        let err = Config::parse("NotAKeyValueLine\n").unwrap_err();
        assert!(matches!(err, CoreError::ConfigInvalid(_)));
    }

    #[test]
    fn parses_a_static_block_line() {
        let cfg = Config::parse("BPs=Nodes=000x111 Type=torus 32CNBlockCnt=4\n").unwrap();
        assert_eq!(cfg.static_blocks.len(), 1);
        assert_eq!(cfg.static_blocks[0].conn_type, ConnType::Torus);
        assert_eq!(cfg.static_blocks[0].small_block_cnt.get(&32), Some(&4));
    }

    #[test]
    fn smallest_block_size_uses_defaults() {
        let cfg = Config::default();
        // 512 * 0.015625 / 8 = 1, rounded, times the 32-node nodecard.
        assert_eq!(cfg.smallest_block_size(), 32);
    }
}
