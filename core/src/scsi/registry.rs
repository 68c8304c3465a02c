//! Device registry: maps (target, LUN) to logical units

use std::path::Path;

use anyhow::{Context, Result, bail};
use itertools::Itertools;
use serde::{Deserialize, Serialize};

use crate::config::{DeviceMapConfig, UnitConfig};
use crate::debuggable::Debuggable;

use super::cdrom::ScsiTargetCdrom;
use super::disk::ScsiTargetDisk;
use super::lun::LogicalUnit;
use super::target::{ScsiTarget, ScsiTargetEvent};

pub const MAX_TARGETS: usize = 16;
pub const MAX_LUNS: usize = 8;

/// Default CDB length for absent units
const DEFAULT_CDB_LEN: usize = 12;

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, strum::IntoStaticStr,
)]
#[serde(rename_all = "lowercase")]
pub enum UnitKind {
    #[default]
    None,
    Disk,
    Optical,
}

/// All logical units on one SCSI bus
pub struct DeviceRegistry {
    units: Vec<Option<LogicalUnit>>,
}

impl Default for DeviceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self {
            units: (0..(MAX_TARGETS * MAX_LUNS)).map(|_| None).collect(),
        }
    }

    pub fn from_config(config: &DeviceMapConfig) -> Result<Self> {
        let mut result = Self::new();
        for unit in &config.units {
            result
                .attach_config(unit)
                .with_context(|| format!("Target {} LUN {}", unit.target, unit.lun))?;
        }
        Ok(result)
    }

    /// Replaces every unit with the ones from a new device map
    pub fn rebuild(&mut self, config: &DeviceMapConfig) -> Result<()> {
        *self = Self::from_config(config)?;
        Ok(())
    }

    fn attach_config(&mut self, unit: &UnitConfig) -> Result<()> {
        let target: Box<dyn ScsiTarget> = match unit.kind {
            UnitKind::None => return Ok(()),
            UnitKind::Disk => match (&unit.image, unit.blocks) {
                (Some(image), _) => Box::new(ScsiTargetDisk::load_disk(image)?),
                (None, Some(blocks)) => Box::new(ScsiTargetDisk::new(blocks)),
                (None, None) => bail!("Disk needs either an image or a block count"),
            },
            UnitKind::Optical => {
                let mut cdrom = ScsiTargetCdrom::new(unit.cdb_len_16);
                if let Some(image) = &unit.image {
                    cdrom.load_media(image)?;
                }
                Box::new(cdrom)
            }
        };
        self.attach(unit.target, unit.lun, target)
    }

    fn index(target: u8, lun: u8) -> Option<usize> {
        if (target as usize) < MAX_TARGETS && (lun as usize) < MAX_LUNS {
            Some(target as usize * MAX_LUNS + lun as usize)
        } else {
            None
        }
    }

    pub fn attach(&mut self, target: u8, lun: u8, device: Box<dyn ScsiTarget>) -> Result<()> {
        let Some(idx) = Self::index(target, lun) else {
            bail!("SCSI address out of range: {}:{}", target, lun);
        };
        if self.units[idx].is_some() {
            bail!("SCSI address {}:{} already in use", target, lun);
        }
        self.units[idx] = Some(LogicalUnit::new(device));
        Ok(())
    }

    pub fn detach(&mut self, target: u8, lun: u8) {
        if let Some(idx) = Self::index(target, lun) {
            self.units[idx] = None;
        }
    }

    pub fn resolve(&mut self, target: u8, lun: u8) -> Option<&mut LogicalUnit> {
        self.units[Self::index(target, lun)?].as_mut()
    }

    pub fn get(&self, target: u8, lun: u8) -> Option<&LogicalUnit> {
        self.units[Self::index(target, lun)?].as_ref()
    }

    pub fn kind(&self, target: u8, lun: u8) -> UnitKind {
        self.get(target, lun)
            .map_or(UnitKind::None, LogicalUnit::kind)
    }

    pub fn present(&self, target: u8, lun: u8) -> bool {
        self.kind(target, lun) != UnitKind::None
    }

    /// Any LUN present at a target ID
    pub fn target_present(&self, target: u8) -> bool {
        (0..MAX_LUNS as u8).any(|lun| self.present(target, lun))
    }

    pub fn cdb_length(&self, target: u8, lun: u8) -> usize {
        self.get(target, lun)
            .map_or(DEFAULT_CDB_LEN, LogicalUnit::cdb_length)
    }

    pub fn block_shift(&self, target: u8, lun: u8) -> Option<u32> {
        self.get(target, lun).map(LogicalUnit::block_shift)
    }

    pub fn sense_buffer(&self, target: u8, lun: u8) -> Option<Vec<u8>> {
        self.get(target, lun).map(LogicalUnit::sense_buffer)
    }

    pub fn read_capacity(&self, target: u8, lun: u8) -> Option<(u32, u32)> {
        self.get(target, lun)?.read_capacity()
    }

    /// Bitmask of target IDs with at least one unit
    pub fn target_mask(&self) -> u16 {
        (0..MAX_TARGETS as u8)
            .filter(|&t| self.target_present(t))
            .fold(0, |mask, t| mask | (1 << t))
    }

    /// Resets every unit, as on a SCSI bus reset
    pub fn reset_all(&mut self) {
        for unit in self.units.iter_mut().flatten() {
            unit.reset();
        }
    }

    /// Resets all LUNs of one target, as on a bus device reset
    pub fn reset_target(&mut self, target: u8) {
        for lun in 0..MAX_LUNS as u8 {
            if let Some(unit) = self.resolve(target, lun) {
                unit.reset();
            }
        }
    }

    /// Inserts media into an optical unit
    pub fn load_media(&mut self, target: u8, lun: u8, path: &Path) -> Result<()> {
        let Some(idx) = Self::index(target, lun) else {
            bail!("SCSI address out of range: {}:{}", target, lun);
        };
        let Some(unit) = self.units[idx].as_ref() else {
            bail!("No unit at {}:{}", target, lun);
        };
        if unit.kind() != UnitKind::Optical {
            bail!("Unit at {}:{} has no removable media", target, lun);
        }
        let mut cdrom = ScsiTargetCdrom::new(unit.cdb_length() == 16);
        cdrom.load_media(path)?;
        self.units[idx] = Some(LogicalUnit::new(Box::new(cdrom)));
        Ok(())
    }

    /// Collects pending events from all units
    pub fn take_events(&mut self) -> Vec<(u8, u8, ScsiTargetEvent)> {
        let mut result = vec![];
        for (idx, unit) in self.units.iter_mut().enumerate() {
            let Some(unit) = unit else {
                continue;
            };
            while let Some(ev) = unit.take_event() {
                result.push(((idx / MAX_LUNS) as u8, (idx % MAX_LUNS) as u8, ev));
            }
        }
        result
    }
}

impl Debuggable for DeviceRegistry {
    fn get_debug_properties(&self) -> crate::debuggable::DebuggableProperties {
        use crate::debuggable::*;
        use crate::{dbgprop_enum, dbgprop_str, dbgprop_string};

        let mut result = vec![];
        for (idx, unit) in self.units.iter().enumerate() {
            let Some(unit) = unit else {
                continue;
            };
            let name = format!("{}:{}", idx / MAX_LUNS, idx % MAX_LUNS);
            result.push(dbgprop_enum!(name, unit.kind()));
        }
        if result.is_empty() {
            result.push(dbgprop_str!("Units", "(no devices)"));
        }
        let sense = self
            .units
            .iter()
            .flatten()
            .map(|u| format!("{:02X}", u.sense_buffer()[2]))
            .join(" ");
        result.push(dbgprop_string!("Sense keys", sense));
        result
    }
}
