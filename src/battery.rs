//! Interfaces to the battery packs and to the contactor plate, plus an
//! in-memory implementation used for dry runs and tests.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

pub type BatteryId = u32;

/// Snapshot of one battery pack.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BatteryModule {
    pub id: BatteryId,
    pub online: bool,
    pub hv_on: bool,
    pub used: bool,
    pub critical_error: bool,
    pub plate_error: bool,
    pub short_circuit_error: bool,
    pub voltage_diff_error: bool,
    pub bus_voltage_diff_error: bool,
    pub temperature_error: bool,
    pub current_error: bool,
    pub temperature_sensing_failure: bool,
    pub voltage_sensing_failure: bool,
    pub fet_failure: bool,
    pub other_hardware_failure: bool,
    pub voltage: f32,
    pub max_cell_voltage: f32,
    pub min_cell_voltage: f32,
    pub cell_voltages: Vec<f32>,
}

impl BatteryModule {
    pub fn new(id: BatteryId) -> Self {
        Self {
            id,
            ..Default::default()
        }
    }

    /// Any flag that forbids driving current through the pack.
    pub fn has_hard_faults(&self) -> bool {
        self.critical_error
            || self.plate_error
            || self.short_circuit_error
            || self.voltage_diff_error
            || self.bus_voltage_diff_error
            || self.temperature_error
            || self.current_error
            || self.temperature_sensing_failure
            || self.voltage_sensing_failure
            || self.fet_failure
            || self.other_hardware_failure
    }

    /// Lowest and highest cell as `(index, voltage)` pairs, 0-based.
    pub fn cell_extremes(&self) -> Option<((usize, f32), (usize, f32))> {
        let mut cells = self.cell_voltages.iter().copied().enumerate();
        let first = cells.next()?;
        Some(cells.fold((first, first), |(min, max), cell| {
            (
                if cell.1 < min.1 { cell } else { min },
                if cell.1 > max.1 { cell } else { max },
            )
        }))
    }
}

/// Aggregate over all packs on the plate.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BatteryInfo {
    pub voltage: f32,
    pub current: f32,
    pub soc: f32,
    pub online_count: usize,
    pub hv_on_count: usize,
    pub max_temperature: f32,
    pub avg_temperature: f32,
    /// kW that may be drawn from the plate.
    pub available_power: f32,
    /// kWh
    pub available_energy: f32,
    /// kW that may be pushed into the plate.
    pub charging_power: f32,
}

pub trait BatteryAggregator: Send + Sync {
    fn module(&self, id: BatteryId) -> Option<BatteryModule>;
    fn modules(&self) -> Vec<BatteryModule>;
    fn hv_count(&self) -> usize;
    fn info(&self) -> BatteryInfo;
    /// Drive-cycle power (kW) requested by the profile and actually applied.
    fn report_drive_cycle_power(&self, requested: f32, applied: f32);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Relay {
    Precharge,
    Positive,
    Negative,
}

pub trait PlateDriver: Send + Sync {
    fn set_module_state(&self, id: BatteryId, online: bool);
    /// `None` addresses every online pack.
    fn hv_on(&self, id: Option<BatteryId>);
    fn hv_off(&self, id: Option<BatteryId>);
    fn set_relay(&self, relay: Relay, closed: bool);
}

#[derive(Debug, Default)]
pub struct BatteryCollection {
    modules: Mutex<BTreeMap<BatteryId, BatteryModule>>,
    info: Mutex<BatteryInfo>,
    drive_cycle_reports: Mutex<Vec<(f32, f32)>>,
}

impl BatteryCollection {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_modules(modules: impl IntoIterator<Item = BatteryModule>) -> Self {
        let collection = Self::new();
        for module in modules {
            collection.insert(module);
        }
        collection
    }

    pub fn insert(&self, module: BatteryModule) {
        self.modules.lock().insert(module.id, module);
    }

    pub fn update<F: FnOnce(&mut BatteryModule)>(&self, id: BatteryId, f: F) -> bool {
        self.modules.lock().get_mut(&id).map(f).is_some()
    }

    pub fn set_info(&self, info: BatteryInfo) {
        *self.info.lock() = info;
    }

    pub fn update_info<F: FnOnce(&mut BatteryInfo)>(&self, f: F) {
        f(&mut self.info.lock());
    }

    pub fn drive_cycle_reports(&self) -> Vec<(f32, f32)> {
        self.drive_cycle_reports.lock().clone()
    }
}

impl BatteryAggregator for BatteryCollection {
    fn module(&self, id: BatteryId) -> Option<BatteryModule> {
        self.modules.lock().get(&id).cloned()
    }

    fn modules(&self) -> Vec<BatteryModule> {
        self.modules.lock().values().cloned().collect()
    }

    fn hv_count(&self) -> usize {
        self.modules.lock().values().filter(|m| m.hv_on).count()
    }

    fn info(&self) -> BatteryInfo {
        let modules = self.modules.lock();
        BatteryInfo {
            online_count: modules.values().filter(|m| m.online).count(),
            hv_on_count: modules.values().filter(|m| m.hv_on).count(),
            ..*self.info.lock()
        }
    }

    fn report_drive_cycle_power(&self, requested: f32, applied: f32) {
        self.drive_cycle_reports.lock().push((requested, applied));
    }
}

/// Plate driver acting on a [`BatteryCollection`]: HV on/off and the online
/// flag are reflected in the pack snapshots, relay moves are recorded.
#[derive(Debug)]
pub struct SimulatedPlate {
    collection: Arc<BatteryCollection>,
    relays: Mutex<Vec<(Relay, bool)>>,
}

impl SimulatedPlate {
    pub fn new(collection: Arc<BatteryCollection>) -> Self {
        Self {
            collection,
            relays: Mutex::new(Vec::new()),
        }
    }

    pub fn relay_log(&self) -> Vec<(Relay, bool)> {
        self.relays.lock().clone()
    }

    fn set_hv(&self, id: Option<BatteryId>, on: bool) {
        let mut modules = self.collection.modules.lock();
        for module in modules.values_mut() {
            let addressed = match id {
                Some(id) => module.id == id,
                None => module.online || !on,
            };
            if addressed {
                module.hv_on = on;
                module.used = on;
            }
        }
    }
}

impl PlateDriver for SimulatedPlate {
    fn set_module_state(&self, id: BatteryId, online: bool) {
        self.collection.update(id, |m| m.online = online);
    }

    fn hv_on(&self, id: Option<BatteryId>) {
        log::debug!("HV on {:?}", id);
        self.set_hv(id, true);
    }

    fn hv_off(&self, id: Option<BatteryId>) {
        log::debug!("HV off {:?}", id);
        self.set_hv(id, false);
    }

    fn set_relay(&self, relay: Relay, closed: bool) {
        log::debug!("Relay {:?} {}", relay, if closed { "closed" } else { "open" });
        self.relays.lock().push((relay, closed));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cell_extremes() {
        let mut module = BatteryModule::new(1);
        assert_eq!(module.cell_extremes(), None);
        module.cell_voltages = vec![3.9, 3.7, 4.0, 3.8];
        assert_eq!(module.cell_extremes(), Some(((1, 3.7), (2, 4.0))));
    }

    #[test]
    fn hard_faults() {
        let mut module = BatteryModule::new(1);
        assert!(!module.has_hard_faults());
        module.fet_failure = true;
        assert!(module.has_hard_faults());
    }

    #[test]
    fn simulated_plate_hv() {
        let collection = Arc::new(BatteryCollection::from_modules([
            BatteryModule {
                online: true,
                ..BatteryModule::new(1)
            },
            BatteryModule::new(2),
        ]));
        let plate = SimulatedPlate::new(collection.clone());
        plate.hv_on(None);
        assert_eq!(collection.hv_count(), 1);
        plate.hv_on(Some(2));
        assert_eq!(collection.hv_count(), 2);
        plate.hv_off(None);
        assert_eq!(collection.hv_count(), 0);
        assert_eq!(collection.info().online_count, 1);
    }
}
