/*!
Base de temps UTC disciplinée GPS + PPS

La base de temps associe une seconde UTC (`base_unix`) à l'instant local
(`base_local_us`) où cette seconde a commencé. Toutes les requêtes de temps
sont extrapolées depuis ce couple avec l'horloge monotone locale.

Deux sources la mettent à jour :
1. Les fix RMC valides fournissent l'étiquette UTC (grossière, arrive en
   retard de la transmission série). L'ancre locale est le dernier front PPS
   s'il est frais, sinon le temps local arrondi à la seconde inférieure.
2. Les fronts PPS avancent la base d'exactement une seconde et recalent
   l'ancre sur le front : l'horloge reste en phase entre deux trames.

Le couple et ses deux indicateurs forment une seule valeur `Baseline`
protégée par une section critique : on lit ou on remplace toujours les
quatre champs ensemble.
*/

use crate::clock::{MonotonicClock, USEC_PER_SEC};
use crate::packet::NtpTimestamp;
use crate::pps::PpsSnapshot;
use chrono::{DateTime, Utc};
use critical_section::Mutex;
use serde::Serialize;
use std::cell::Cell;
use std::sync::Arc;
use tracing::{debug, info};

/// Différence entre l'epoch NTP (1900-01-01) et l'epoch Unix (1970-01-01) en secondes
pub const NTP_UNIX_OFFSET: u64 = 2_208_988_800;

/// Seuils de discipline PPS (en microsecondes)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Discipline {
    /// Âge maximal (exclu) d'un front PPS utilisable comme ancre d'un fix
    pub pps_fresh_us: u64,

    /// Intervalle minimal plausible entre deux fronts
    pub pps_min_interval_us: u64,

    /// Intervalle maximal plausible entre deux fronts
    pub pps_max_interval_us: u64,

    /// Âge maximal du dernier front pour considérer le PPS sain
    pub lock_max_edge_age_us: u64,
}

impl Default for Discipline {
    fn default() -> Self {
        Discipline {
            pps_fresh_us: 990_000,
            pps_min_interval_us: 900_000,
            pps_max_interval_us: 1_100_000,
            lock_max_edge_age_us: 1_500_000,
        }
    }
}

impl Discipline {
    /// Vrai si `delta_us` ressemble à une seconde
    pub fn is_plausible_second(&self, delta_us: u64) -> bool {
        (self.pps_min_interval_us..=self.pps_max_interval_us).contains(&delta_us)
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct Baseline {
    base_unix: u64,
    base_local_us: u64,
    have_time: bool,
    synced: bool,
}

/// Indicateurs de la base de temps, lus ensemble
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TimebaseStatus {
    /// Une seconde UTC de référence existe
    pub have_time: bool,

    /// La base est synchronisée sur le GPS
    pub synced: bool,
}

/// Temps Unix courant
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnixTime {
    pub seconds: u64,
    pub micros: u32,
}

/// Origine de l'ancre locale d'un fix
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnchorSource {
    /// Front PPS frais
    Pps,
    /// Temps local arrondi à la seconde
    Snapped,
}

/// Effet d'un fix GPS sur la base de temps
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FixOutcome {
    Applied(AnchorSource),
    /// Même seconde déjà ancrée sur le PPS : la phase PPS est conservée
    Skipped,
}

/// Horloge UTC disciplinée
pub struct Timebase {
    clock: Arc<dyn MonotonicClock>,
    discipline: Discipline,
    state: Mutex<Cell<Baseline>>,
}

impl Timebase {
    pub fn new(clock: Arc<dyn MonotonicClock>, discipline: Discipline) -> Self {
        Timebase {
            clock,
            discipline,
            state: Mutex::new(Cell::new(Baseline::default())),
        }
    }

    fn load(&self) -> Baseline {
        critical_section::with(|cs| self.state.borrow(cs).get())
    }

    pub fn discipline(&self) -> &Discipline {
        &self.discipline
    }

    /// Retourne l'horloge locale utilisée pour l'extrapolation
    pub fn clock(&self) -> &dyn MonotonicClock {
        self.clock.as_ref()
    }

    /// Nouveau fix RMC valide
    pub fn on_gps_fix(&self, unix_seconds: u64, pps: PpsSnapshot) -> FixOutcome {
        let now_us = self.clock.now_us();

        let (anchor_us, source) = if pps.is_fresh(now_us, self.discipline.pps_fresh_us) {
            (pps.last_edge_us, AnchorSource::Pps)
        } else {
            (now_us - now_us % USEC_PER_SEC, AnchorSource::Snapped)
        };

        let (outcome, previous) = critical_section::with(|cs| {
            let cell = self.state.borrow(cs);
            let current = cell.get();

            if current.synced && current.base_unix == unix_seconds && source == AnchorSource::Pps {
                return (FixOutcome::Skipped, current);
            }

            cell.set(Baseline {
                base_unix: unix_seconds,
                base_local_us: anchor_us,
                have_time: true,
                synced: true,
            });
            (FixOutcome::Applied(source), current)
        });

        match outcome {
            FixOutcome::Applied(source) if !previous.synced => {
                info!(
                    "Timebase synchronized to GPS: unix {} ({:?} anchor)",
                    unix_seconds, source
                );
            }
            FixOutcome::Applied(source) if previous.base_unix != unix_seconds => {
                debug!(
                    "Timebase baseline replaced: unix {} -> {} ({:?} anchor)",
                    previous.base_unix, unix_seconds, source
                );
            }
            _ => {}
        }

        outcome
    }

    /// Nouveau front PPS. Retourne vrai si la base a avancé d'une seconde.
    pub fn on_pps_edge(&self, edge_local_us: u64) -> bool {
        let discipline = self.discipline;

        critical_section::with(|cs| {
            let cell = self.state.borrow(cs);
            let mut base = cell.get();

            if !base.have_time || edge_local_us <= base.base_local_us {
                return false;
            }
            if !discipline.is_plausible_second(edge_local_us - base.base_local_us) {
                return false;
            }

            base.base_unix += 1;
            base.base_local_us = edge_local_us;
            cell.set(base);
            true
        })
    }

    /// Remet la base dans l'état non synchronisé
    #[allow(dead_code)]
    pub fn clear(&self) {
        critical_section::with(|cs| self.state.borrow(cs).set(Baseline::default()));
        info!("Timebase cleared");
    }

    pub fn status(&self) -> TimebaseStatus {
        let base = self.load();
        TimebaseStatus {
            have_time: base.have_time,
            synced: base.synced,
        }
    }

    #[allow(dead_code)]
    pub fn have_time(&self) -> bool {
        self.status().have_time
    }

    #[allow(dead_code)]
    pub fn is_synced(&self) -> bool {
        self.status().synced
    }

    /// Temps Unix courant, None tant qu'aucune référence n'existe
    pub fn now_unix(&self) -> Option<UnixTime> {
        let base = self.load();
        if !base.have_time {
            return None;
        }

        let elapsed_us = self.clock.now_us().saturating_sub(base.base_local_us);
        Some(UnixTime {
            seconds: base.base_unix + elapsed_us / USEC_PER_SEC,
            micros: (elapsed_us % USEC_PER_SEC) as u32,
        })
    }

    /// Temps courant au format NTP
    pub fn now_ntp(&self) -> Option<NtpTimestamp> {
        let now = self.now_unix()?;
        Some(NtpTimestamp::from_unix(now.seconds, now.micros))
    }

    /// Temps courant en UTC, pour l'affichage et les logs
    pub fn now_utc(&self) -> Option<DateTime<Utc>> {
        let now = self.now_unix()?;
        DateTime::from_timestamp(i64::try_from(now.seconds).ok()?, now.micros * 1_000)
    }
}
