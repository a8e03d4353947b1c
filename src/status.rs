use crate::gps_state::DeviceState;
use crate::nmea::GpsStatus;
use crate::pps::PpsSnapshot;
use crate::server::NtpCounters;
use crate::timebase::TimebaseStatus;
use serde::Serialize;
use std::sync::{Arc, RwLock};

/// Résumé PPS pour l'affichage
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PpsSummary {
    #[serde(flatten)]
    pub capture: PpsSnapshot,

    /// Âge du dernier front (ms), None si aucun front
    pub last_edge_age_ms: Option<u64>,

    /// PPS jugé sain par la machine d'états
    pub healthy: bool,
}

/// Compteurs du découpage en lignes
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct FramerCounters {
    /// Octets perdus, tampon circulaire plein
    pub overflows: u32,

    /// Trames abandonnées car trop longues
    pub truncated: u32,
}

/// Vue d'ensemble publiée par la boucle principale
#[derive(Debug, Clone, Serialize)]
pub struct StatusSnapshot {
    pub state: DeviceState,
    pub gps: GpsStatus,
    pub pps: PpsSummary,
    pub timebase: TimebaseStatus,
    pub framer: FramerCounters,

    /// Trames NMEA reconnues depuis le démarrage
    pub nmea_sentences: u64,

    /// Serveur NTP en écoute
    pub server_running: bool,
    pub ntp: NtpCounters,
}

impl Default for StatusSnapshot {
    fn default() -> Self {
        StatusSnapshot {
            state: DeviceState::Booting,
            gps: GpsStatus::default(),
            pps: PpsSummary::default(),
            timebase: TimebaseStatus::default(),
            framer: FramerCounters::default(),
            nmea_sentences: 0,
            server_running: false,
            ntp: NtpCounters::default(),
        }
    }
}

/// Tableau d'état partagé via Arc<RwLock>
#[derive(Clone, Default)]
pub struct StatusBoard {
    snapshot: Arc<RwLock<StatusSnapshot>>,
}

impl StatusBoard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Lit le dernier état publié
    pub fn get(&self) -> StatusSnapshot {
        match self.snapshot.read() {
            Ok(snapshot) => snapshot.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Remplace l'état publié
    pub fn publish(&self, snapshot: StatusSnapshot) {
        if let Ok(mut current) = self.snapshot.write() {
            *current = snapshot;
        }
    }
}
