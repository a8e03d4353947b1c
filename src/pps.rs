/*!
Capture des fronts PPS (Pulse Per Second)

Le gestionnaire de front (interruption GPIO, ou ici le thread série qui
surveille la ligne CTS) horodate chaque front montant avec l'horloge
monotone locale. Les trois champs ne forment pas une unité atomique :
les lecteurs doivent toujours revalider fraîcheur et intervalle.
*/

use serde::Serialize;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

/// Dernière mesure PPS connue
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PpsSnapshot {
    /// Nombre de fronts observés depuis le démarrage
    pub edge_count: u32,

    /// Intervalle entre les deux derniers fronts (µs)
    pub last_interval_us: u32,

    /// Temps local du dernier front (µs, horloge monotone)
    pub last_edge_us: u64,
}

impl PpsSnapshot {
    /// Âge du dernier front, None si aucun front n'a été vu
    pub fn age_us(&self, now_us: u64) -> Option<u64> {
        if self.edge_count == 0 {
            return None;
        }
        Some(now_us.saturating_sub(self.last_edge_us))
    }

    /// Vrai si un front a été vu il y a strictement moins de `window_us`
    pub fn is_fresh(&self, now_us: u64, window_us: u64) -> bool {
        matches!(self.age_us(now_us), Some(age) if age < window_us)
    }
}

/// État partagé entre le gestionnaire de front (écrivain unique) et les lecteurs
pub struct PpsCapture {
    edge_count: AtomicU32,
    last_interval_us: AtomicU32,
    last_edge_us: AtomicU64,
    /// Compteur 32 bits du front précédent, privé au gestionnaire
    prev_edge_us32: AtomicU32,
}

impl PpsCapture {
    pub const fn new() -> Self {
        PpsCapture {
            edge_count: AtomicU32::new(0),
            last_interval_us: AtomicU32::new(0),
            last_edge_us: AtomicU64::new(0),
            prev_edge_us32: AtomicU32::new(0),
        }
    }

    /// Enregistre un front montant. O(1), sans verrou.
    pub fn on_edge(&self, now_us: u64) {
        // Soustraction 32 bits : correcte même après rebouclage du compteur
        let now32 = now_us as u32;
        let prev32 = self.prev_edge_us32.swap(now32, Ordering::Relaxed);
        let interval = now32.wrapping_sub(prev32);

        self.last_interval_us.store(interval, Ordering::Relaxed);
        self.last_edge_us.store(now_us, Ordering::Relaxed);
        self.edge_count.fetch_add(1, Ordering::Release);
    }

    /// Lecture opportuniste des trois champs
    pub fn snapshot(&self) -> PpsSnapshot {
        let edge_count = self.edge_count.load(Ordering::Acquire);
        PpsSnapshot {
            edge_count,
            last_interval_us: self.last_interval_us.load(Ordering::Relaxed),
            last_edge_us: self.last_edge_us.load(Ordering::Relaxed),
        }
    }
}

impl Default for PpsCapture {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_edges_and_interval() {
        let pps = PpsCapture::new();
        assert_eq!(pps.snapshot().edge_count, 0);

        pps.on_edge(5_000_000);
        pps.on_edge(6_000_120);

        let snap = pps.snapshot();
        assert_eq!(snap.edge_count, 2);
        assert_eq!(snap.last_interval_us, 1_000_120);
        assert_eq!(snap.last_edge_us, 6_000_120);
    }

    #[test]
    fn test_interval_wraps_32_bits() {
        let pps = PpsCapture::new();
        let before_wrap = u32::MAX as u64 - 400_000;

        pps.on_edge(before_wrap);
        pps.on_edge(before_wrap + 1_000_000);

        assert_eq!(pps.snapshot().last_interval_us, 1_000_000);
    }

    #[test]
    fn test_freshness() {
        let snap = PpsSnapshot::default();
        assert_eq!(snap.age_us(10), None);
        assert!(!snap.is_fresh(10, 990_000));

        let pps = PpsCapture::new();
        pps.on_edge(1_000_000);
        let snap = pps.snapshot();

        assert_eq!(snap.age_us(1_200_000), Some(200_000));
        assert!(snap.is_fresh(1_989_999, 990_000));
        assert!(!snap.is_fresh(1_990_000, 990_000));
    }

    #[test]
    fn test_concurrent_writer_and_reader() {
        let pps = std::sync::Arc::new(PpsCapture::new());
        let writer = {
            let pps = std::sync::Arc::clone(&pps);
            std::thread::spawn(move || {
                for i in 1..=1_000u64 {
                    pps.on_edge(i * 1_000_000);
                }
            })
        };

        let mut last = 0;
        while last < 1_000 {
            let snap = pps.snapshot();
            assert!(snap.edge_count >= last);
            last = snap.edge_count;
        }
        writer.join().unwrap();
        assert_eq!(pps.snapshot().last_edge_us, 1_000_000_000);
    }
}
