//! Host-side configuration: attached units and adapter settings

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::scsi::registry::UnitKind;

/// One configured logical unit
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnitConfig {
    pub target: u8,
    #[serde(default)]
    pub lun: u8,
    pub kind: UnitKind,

    /// Image file; a disk without one is created blank, an optical
    /// drive without one starts empty
    #[serde(default)]
    pub image: Option<PathBuf>,

    /// Size of a blank disk in blocks
    #[serde(default)]
    pub blocks: Option<usize>,

    /// Optical drive latches 16-byte CDBs
    #[serde(default)]
    pub cdb_len_16: bool,
}

/// The device map of one SCSI bus
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceMapConfig {
    #[serde(default)]
    pub units: Vec<UnitConfig>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, strum::IntoStaticStr)]
pub enum Aha154xModel {
    #[serde(rename = "154xA")]
    Aha154xA,
    #[default]
    #[serde(rename = "154xB")]
    Aha154xB,
    #[serde(rename = "154xC")]
    Aha154xC,
    #[serde(rename = "154xCF")]
    Aha154xCF,
    #[serde(rename = "154xCP")]
    Aha154xCP,
    #[serde(rename = "1640")]
    Aha1640,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Aha154xConfig {
    pub model: Aha154xModel,
    pub host_id: u8,
    pub irq: u8,
    pub dma: u8,
}

impl Default for Aha154xConfig {
    fn default() -> Self {
        Self {
            model: Aha154xModel::default(),
            host_id: 7,
            irq: 11,
            dma: 6,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, strum::IntoStaticStr)]
pub enum BusLogicModel {
    #[serde(rename = "542BH")]
    Bt542bh,
    #[default]
    #[serde(rename = "545S")]
    Bt545s,
    #[serde(rename = "958D")]
    Bt958d,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BusLogicConfig {
    pub model: BusLogicModel,
    pub host_id: u8,
    pub irq: u8,
    pub dma: u8,
}

impl Default for BusLogicConfig {
    fn default() -> Self {
        Self {
            model: BusLogicModel::default(),
            host_id: 7,
            irq: 11,
            dma: 6,
        }
    }
}

/// Parses a JSON configuration document
pub fn from_json<T: DeserializeOwned>(json: &str) -> Result<T> {
    serde_json::from_str(json).context("Invalid configuration")
}

/// Loads a JSON configuration file
pub fn load_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let json = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    from_json(&json).with_context(|| format!("Failed to parse {}", path.display()))
}
