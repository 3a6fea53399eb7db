//! Configuration file management for rfmesh.
//!
//! Reads/writes `~/.rfmesh/config.yaml` with node identity, forwarding
//! settings, fusion timeout and the anchor positions used for trilateration.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::checksum::ChecksumKind;
use crate::frame::DEFAULT_HOP_BUDGET;
use crate::trilateration::Anchor;
use crate::types::{MeshError, NodeId, Result};

/// Full configuration structure.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub node: NodeConfig,
    pub dedup: DedupConfig,
    pub fusion: FusionConfig,
    /// Reporting node id -> Cartesian anchor position.
    pub anchors: BTreeMap<NodeId, Anchor>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NodeConfig {
    pub id: NodeId,
    pub hop_budget: u8,
    pub protocol_version: u8,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DedupConfig {
    /// Recent-packet window; 0 disables duplicate suppression.
    pub ttl_ms: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FusionConfig {
    pub timeout_s: u64,
}

impl FusionConfig {
    pub fn timeout_ms(&self) -> u64 {
        self.timeout_s.saturating_mul(1000)
    }
}

pub fn default_anchors() -> BTreeMap<NodeId, Anchor> {
    BTreeMap::from([
        (1, Anchor::new(0.0, 0.0)),
        (2, Anchor::new(100.0, 0.0)),
        (3, Anchor::new(50.0, 86.6)),
    ])
}

impl Default for Config {
    fn default() -> Self {
        Config {
            node: NodeConfig {
                id: 1,
                hop_budget: DEFAULT_HOP_BUDGET,
                protocol_version: 1,
            },
            dedup: DedupConfig { ttl_ms: 30_000 },
            fusion: FusionConfig { timeout_s: 120 },
            anchors: default_anchors(),
        }
    }
}

/// Get the config directory path (`~/.rfmesh/`).
pub fn config_dir() -> PathBuf {
    dirs_home().join(".rfmesh")
}

/// Get the config file path.
pub fn config_file() -> PathBuf {
    config_dir().join("config.yaml")
}

fn dirs_home() -> PathBuf {
    std::env::var("HOME")
        .or_else(|_| std::env::var("USERPROFILE"))
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("."))
}

/// Load config from `~/.rfmesh/config.yaml`.
///
/// Returns default config if file doesn't exist.
pub fn load_config() -> Config {
    load_config_from(&config_file())
}

/// Load config from an explicit path, falling back to defaults.
pub fn load_config_from(path: &Path) -> Config {
    match std::fs::read_to_string(path) {
        Ok(text) => parse_config(&text),
        Err(_) => Config::default(),
    }
}

/// Save config to `~/.rfmesh/config.yaml`.
pub fn save_config(config: &Config) -> Result<PathBuf> {
    let path = config_file();
    save_config_to(&path, config)?;
    Ok(path)
}

pub fn save_config_to(path: &Path, config: &Config) -> Result<()> {
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir).map_err(|e| MeshError::Config(e.to_string()))?;
    }
    std::fs::write(path, serialize_config(config)).map_err(|e| MeshError::Config(e.to_string()))
}

/// Parse simple YAML-like config text. Unparseable values keep their default.
pub fn parse_config(text: &str) -> Config {
    let mut config = Config::default();
    let mut current_section: Option<String> = None;
    let mut anchors_seen = false;

    for line in text.lines() {
        let stripped = line.trim();
        if stripped.is_empty() || stripped.starts_with('#') {
            continue;
        }

        let is_indented = line.starts_with("  ") || line.starts_with('\t');

        let Some((key, val)) = stripped.split_once(':') else {
            continue;
        };
        let key = key.trim();
        let val = val.trim();

        if !is_indented {
            current_section = val.is_empty().then(|| key.to_string());
            continue;
        }
        let Some(section) = current_section.as_deref() else {
            continue;
        };

        match section {
            "node" => match key {
                "id" => set_parsed(&mut config.node.id, val),
                "hop_budget" => set_parsed(&mut config.node.hop_budget, val),
                "protocol_version" => {
                    if let Ok(v) = val.parse::<u8>() {
                        if ChecksumKind::for_version(v).is_ok() {
                            config.node.protocol_version = v;
                        }
                    }
                }
                _ => {}
            },
            "dedup" => {
                if key == "ttl_ms" {
                    set_parsed(&mut config.dedup.ttl_ms, val);
                }
            }
            "fusion" => {
                if key == "timeout_s" {
                    set_parsed(&mut config.fusion.timeout_s, val);
                }
            }
            "anchors" => {
                let (Ok(id), Some(anchor)) = (key.parse::<NodeId>(), parse_anchor(val)) else {
                    continue;
                };
                // A file that lists anchors replaces the defaults wholesale.
                if !anchors_seen {
                    config.anchors.clear();
                    anchors_seen = true;
                }
                config.anchors.insert(id, anchor);
            }
            _ => {}
        }
    }

    config
}

fn set_parsed<T: std::str::FromStr>(slot: &mut T, val: &str) {
    if let Ok(v) = val.parse() {
        *slot = v;
    }
}

/// `x, y` or `[x, y]`.
fn parse_anchor(val: &str) -> Option<Anchor> {
    let inner = val.trim_start_matches('[').trim_end_matches(']');
    let (x, y) = inner.split_once(',')?;
    let x: f64 = x.trim().parse().ok()?;
    let y: f64 = y.trim().parse().ok()?;
    (x.is_finite() && y.is_finite()).then(|| Anchor::new(x, y))
}

/// Serialize config to YAML-like text.
pub fn serialize_config(config: &Config) -> String {
    let mut lines = vec!["# rfmesh configuration".to_string(), String::new()];

    lines.push("node:".into());
    lines.push(format!("  id: {}", config.node.id));
    lines.push(format!("  hop_budget: {}", config.node.hop_budget));
    lines.push(format!("  protocol_version: {}", config.node.protocol_version));
    lines.push(String::new());

    lines.push("dedup:".into());
    lines.push(format!("  ttl_ms: {}", config.dedup.ttl_ms));
    lines.push(String::new());

    lines.push("fusion:".into());
    lines.push(format!("  timeout_s: {}", config.fusion.timeout_s));
    lines.push(String::new());

    lines.push("anchors:".into());
    for (id, a) in &config.anchors {
        lines.push(format!("  {id}: [{}, {}]", a.x, a.y));
    }

    lines.join("\n") + "\n"
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
