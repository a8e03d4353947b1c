/*!
Machine d'états d'acquisition GPS

L'état est recalculé à chaque tour de boucle à partir du statut NMEA et de
la dernière mesure PPS. Il n'a pas de mémoire : seules les entrées comptent.
*/

use crate::nmea::GpsStatus;
use crate::pps::PpsSnapshot;
use crate::timebase::Discipline;
use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};

/// État du récepteur GPS
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[repr(u8)]
pub enum DeviceState {
    /// Réservé, jamais produit par `evaluate`
    Error = 0,
    Booting = 1,
    Acquiring = 2,
    Acquired = 3,
    Locked = 4,
}

impl DeviceState {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceState::Error => "ERROR",
            DeviceState::Booting => "BOOTING",
            DeviceState::Acquiring => "ACQUIRING",
            DeviceState::Acquired => "ACQUIRED",
            DeviceState::Locked => "LOCKED",
        }
    }
}

impl From<u8> for DeviceState {
    fn from(value: u8) -> Self {
        match value {
            1 => DeviceState::Booting,
            2 => DeviceState::Acquiring,
            3 => DeviceState::Acquired,
            4 => DeviceState::Locked,
            _ => DeviceState::Error,
        }
    }
}

impl fmt::Display for DeviceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// État partagé entre la boucle principale (écrivain) et les lecteurs
pub struct SharedDeviceState(AtomicU8);

impl SharedDeviceState {
    pub const fn new() -> Self {
        SharedDeviceState(AtomicU8::new(DeviceState::Booting as u8))
    }

    pub fn load(&self) -> DeviceState {
        DeviceState::from(self.0.load(Ordering::Acquire))
    }

    /// Publie un nouvel état et retourne le précédent
    pub fn store(&self, state: DeviceState) -> DeviceState {
        DeviceState::from(self.0.swap(state as u8, Ordering::AcqRel))
    }
}

impl Default for SharedDeviceState {
    fn default() -> Self {
        Self::new()
    }
}

/// Vrai si le PPS est sain : au moins deux fronts, dernier intervalle
/// proche d'une seconde et dernier front récent
pub fn pps_healthy(pps: &PpsSnapshot, now_us: u64, discipline: &Discipline) -> bool {
    if pps.edge_count < 2 {
        return false;
    }
    if !discipline.is_plausible_second(pps.last_interval_us as u64) {
        return false;
    }
    matches!(pps.age_us(now_us), Some(age) if age <= discipline.lock_max_edge_age_us)
}

/// Calcule l'état d'acquisition
pub fn evaluate(
    status: &GpsStatus,
    pps: &PpsSnapshot,
    now_us: u64,
    discipline: &Discipline,
) -> DeviceState {
    if !(status.rmc_valid && status.gga_fix) {
        return DeviceState::Acquiring;
    }

    if pps_healthy(pps, now_us, discipline) {
        DeviceState::Locked
    } else {
        DeviceState::Acquired
    }
}
