/*!
Boucle principale de synchronisation

Propriétaire du découpage en lignes et du statut GPS. À chaque tour :
1. observe les nouveaux fronts PPS et fait avancer la base de temps
2. extrait et applique les trames NMEA complètes (fix RMC → base de temps)
3. recalcule l'état d'acquisition et publie le tableau d'état
*/

use crate::gps_state::{self, DeviceState, SharedDeviceState};
use crate::line_framer::{Consumer, LineFramer, LINE_CAPACITY, RING_SIZE};
use crate::nmea::GpsStatus;
use crate::pps::{PpsCapture, PpsSnapshot};
use crate::server::ServerStats;
use crate::status::{FramerCounters, PpsSummary, StatusBoard, StatusSnapshot};
use crate::timebase::Timebase;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Période de la boucle principale
const LOOP_PERIOD: Duration = Duration::from_millis(2);

/// Intervalle minimal entre deux publications du tableau d'état (µs)
const PUBLISH_INTERVAL_US: u64 = 250_000;

pub struct SyncLoop {
    framer: LineFramer<RING_SIZE>,
    line: [u8; LINE_CAPACITY],
    gps: GpsStatus,
    pps: Arc<PpsCapture>,
    timebase: Arc<Timebase>,
    state: Arc<SharedDeviceState>,
    board: StatusBoard,
    server_stats: Arc<ServerStats>,
    last_edge_count: u32,
    nmea_sentences: u64,
    last_publish_us: Option<u64>,
}

impl SyncLoop {
    pub fn new(
        consumer: Consumer<RING_SIZE>,
        pps: Arc<PpsCapture>,
        timebase: Arc<Timebase>,
        state: Arc<SharedDeviceState>,
        board: StatusBoard,
        server_stats: Arc<ServerStats>,
    ) -> Self {
        let last_edge_count = pps.snapshot().edge_count;
        SyncLoop {
            framer: LineFramer::new(consumer),
            line: [0u8; LINE_CAPACITY],
            gps: GpsStatus::new(),
            pps,
            timebase,
            state,
            board,
            server_stats,
            last_edge_count,
            nmea_sentences: 0,
            last_publish_us: None,
        }
    }

    #[allow(dead_code)]
    pub fn gps_status(&self) -> &GpsStatus {
        &self.gps
    }

    /// Tourne jusqu'à la demande d'arrêt
    pub fn run(&mut self, shutdown: &AtomicBool) {
        info!("Sync loop started");
        while !shutdown.load(Ordering::Relaxed) {
            self.tick();
            std::thread::sleep(LOOP_PERIOD);
        }
        self.publish(self.timebase.clock().now_us());
        info!("Sync loop stopped ({} NMEA sentences)", self.nmea_sentences);
    }

    /// Un tour de boucle. Retourne le nombre de lignes traitées.
    pub fn tick(&mut self) -> usize {
        self.observe_pps();

        let mut lines = 0;
        while let Some(line) = self.framer.try_read_line(&mut self.line) {
            lines += 1;
            match self.gps.update_from_nmea(line) {
                Ok(parsed) => {
                    self.nmea_sentences += 1;
                    if let Some(unix) = parsed.utc_fix {
                        self.timebase.on_gps_fix(unix, self.pps.snapshot());
                    }
                    self.update_state();
                }
                Err(e) => debug!("NMEA line ignored: {}", e),
            }
        }

        let state_changed = self.update_state();

        let now_us = self.timebase.clock().now_us();
        let due = match self.last_publish_us {
            Some(last) => now_us.saturating_sub(last) >= PUBLISH_INTERVAL_US,
            None => true,
        };
        if due || state_changed || lines > 0 {
            self.publish(now_us);
        }

        lines
    }

    fn observe_pps(&mut self) {
        let snapshot = self.pps.snapshot();
        if snapshot.edge_count == self.last_edge_count {
            return;
        }

        let new_edges = snapshot.edge_count.wrapping_sub(self.last_edge_count);
        self.last_edge_count = snapshot.edge_count;
        if new_edges > 1 {
            debug!("{} PPS edges seen at once, only the latest is used", new_edges);
        }

        let discipline = self.timebase.discipline();
        if snapshot.edge_count >= 2
            && !discipline.is_plausible_second(snapshot.last_interval_us as u64)
        {
            warn!(
                "PPS interval out of window: {} us",
                snapshot.last_interval_us
            );
        }

        if self.timebase.on_pps_edge(snapshot.last_edge_us) {
            debug!("Timebase stepped on PPS edge #{}", snapshot.edge_count);
        }
    }

    /// Recalcule l'état et retourne vrai s'il a changé
    fn update_state(&mut self) -> bool {
        let now_us = self.timebase.clock().now_us();
        let pps = self.pps.snapshot();
        let next = gps_state::evaluate(&self.gps, &pps, now_us, self.timebase.discipline());

        let previous = self.state.store(next);
        if previous != next {
            info!("GPS state: {} -> {}", previous, next);
            if next == DeviceState::Locked {
                if let Some(utc) = self.timebase.now_utc() {
                    info!("Locked at {}", utc.format("%Y-%m-%d %H:%M:%S%.6fZ"));
                }
            }
            return true;
        }
        false
    }

    fn publish(&mut self, now_us: u64) {
        let pps = self.pps.snapshot();
        self.board.publish(StatusSnapshot {
            state: self.state.load(),
            gps: self.gps.clone(),
            pps: summarize(pps, now_us, &self.timebase),
            timebase: self.timebase.status(),
            framer: FramerCounters {
                overflows: self.framer.overflow_count(),
                truncated: self.framer.truncated_count(),
            },
            nmea_sentences: self.nmea_sentences,
            server_running: self.server_stats.is_running(),
            ntp: self.server_stats.counters(),
        });
        self.last_publish_us = Some(now_us);
    }
}

fn summarize(pps: PpsSnapshot, now_us: u64, timebase: &Timebase) -> PpsSummary {
    PpsSummary {
        capture: pps,
        last_edge_age_ms: pps.age_us(now_us).map(|age| age / 1_000),
        healthy: gps_state::pps_healthy(&pps, now_us, timebase.discipline()),
    }
}
