//! Per-module state records built from decoded updates.

use crate::protocol::{AdcUpdate, CellUpdate, DecodedUpdate, ModuleUpdate};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};

/// Raw cell voltage is transmitted in tenths of a millivolt; dividing by this yields millivolts.
pub const CELL_VOLTAGE_DIVISOR: f64 = 10.0;
pub const MODULE_VOLTAGE_DIVISOR: f64 = 100.0;
pub const CELL_DIFF_DIVISOR: f64 = 10.0;

/// ADC channel wired to the current shunt.
pub const CURRENT_ADC_CHANNEL: u8 = 7;
/// Shunt amplifier output at zero current.
pub const CURRENT_ZERO_OFFSET: i32 = 25000;
/// Milliamps per ADC count.
pub const CURRENT_SCALE: f64 = 1.8;

/// Converts a raw ADC reading of the shunt channel to milliamps.
pub fn current_from_raw(raw_value: u16) -> f64 {
    f64::from(i32::from(raw_value) - CURRENT_ZERO_OFFSET) * CURRENT_SCALE
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CellState {
    /// Millivolts.
    pub voltage: f64,
    /// Non-zero while balancing.
    pub balancing: u8,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AdcState {
    pub raw_value: u16,
}

/// Everything known about one module. Serialises to the state payload.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ModuleAggregate {
    pub cells: BTreeMap<u8, CellState>,
    pub adc: BTreeMap<u8, AdcState>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub m1_voltage: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub m2_voltage: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cell_diff: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reserved: Option<u16>,
    /// Milliamps, derived from ADC channel 7.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current: Option<f64>,
    #[serde(skip)]
    discovery_published: bool,
}

impl ModuleAggregate {
    pub fn discovery_published(&self) -> bool {
        self.discovery_published
    }

    fn apply_cell(&mut self, update: &CellUpdate) {
        self.cells.insert(
            update.cell_index,
            CellState {
                voltage: f64::from(update.voltage) / CELL_VOLTAGE_DIVISOR,
                balancing: update.balancing,
            },
        );
    }

    fn apply_adc(&mut self, update: &AdcUpdate) {
        self.adc.insert(
            update.channel_index,
            AdcState {
                raw_value: update.raw_value,
            },
        );
        if update.channel_index == CURRENT_ADC_CHANNEL {
            self.current = Some(current_from_raw(update.raw_value));
        }
    }

    fn apply_module(&mut self, update: &ModuleUpdate) {
        self.m1_voltage = Some(f64::from(update.m1_voltage) / MODULE_VOLTAGE_DIVISOR);
        self.m2_voltage = Some(f64::from(update.m2_voltage) / MODULE_VOLTAGE_DIVISOR);
        self.cell_diff = Some(f64::from(update.cell_diff) / CELL_DIFF_DIVISOR);
        self.reserved = Some(update.reserved);
    }
}

/// Owns the records of every module seen so far. Records are never removed.
#[derive(Debug, Default)]
pub struct ModuleStore {
    modules: HashMap<u32, ModuleAggregate>,
}

impl ModuleStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Applies `update` to its module, creating the record on first use.
    ///
    /// Returns the updated record and whether discovery metadata still has to be
    /// published for this module.
    pub fn apply(&mut self, update: &DecodedUpdate) -> (&ModuleAggregate, bool) {
        let module_id = update.module_id();
        let aggregate = self.modules.entry(module_id).or_insert_with(|| {
            log::debug!("New module {module_id}");
            ModuleAggregate::default()
        });
        match update {
            DecodedUpdate::Cell(u) => aggregate.apply_cell(u),
            DecodedUpdate::Adc(u) => aggregate.apply_adc(u),
            DecodedUpdate::Module(u) => aggregate.apply_module(u),
        }
        let first_time_seen = !aggregate.discovery_published;
        (&*aggregate, first_time_seen)
    }

    /// Records that discovery metadata went out for `module_id`. Unknown ids are ignored.
    pub fn mark_discovery_published(&mut self, module_id: u32) {
        if let Some(aggregate) = self.modules.get_mut(&module_id) {
            aggregate.discovery_published = true;
        }
    }

    pub fn get(&self, module_id: u32) -> Option<&ModuleAggregate> {
        self.modules.get(&module_id)
    }

    pub fn len(&self) -> usize {
        self.modules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }
}
