/// Nombre de microsecondes par seconde
pub const USEC_PER_SEC: u64 = 1_000_000;

/// Trait pour les horloges locales monotones
///
/// C'est l'équivalent du compteur matériel libre d'un microcontrôleur :
/// il ne recule jamais et n'a aucun lien avec l'UTC.
pub trait MonotonicClock: Send + Sync {
    /// Retourne le temps local en microsecondes depuis une origine arbitraire
    fn now_us(&self) -> u64;
}

/// Horloge monotone du système hôte
pub struct SystemMonotonic {
    #[cfg(not(unix))]
    origin: std::time::Instant,
}

impl SystemMonotonic {
    pub fn new() -> Self {
        SystemMonotonic {
            #[cfg(not(unix))]
            origin: std::time::Instant::now(),
        }
    }

    /// Lit CLOCK_MONOTONIC, non affecté par les réglages de l'horloge système
    #[cfg(unix)]
    fn read_us(&self) -> u64 {
        use libc::{clock_gettime, timespec, CLOCK_MONOTONIC};
        use std::mem::MaybeUninit;

        unsafe {
            let mut ts = MaybeUninit::<timespec>::uninit();
            if clock_gettime(CLOCK_MONOTONIC, ts.as_mut_ptr()) == 0 {
                let ts = ts.assume_init();
                (ts.tv_sec as u64) * USEC_PER_SEC + (ts.tv_nsec as u64) / 1_000
            } else {
                // CLOCK_MONOTONIC est garanti par POSIX, ne devrait jamais arriver
                0
            }
        }
    }

    #[cfg(not(unix))]
    fn read_us(&self) -> u64 {
        self.origin.elapsed().as_micros() as u64
    }
}

impl Default for SystemMonotonic {
    fn default() -> Self {
        Self::new()
    }
}

impl MonotonicClock for SystemMonotonic {
    fn now_us(&self) -> u64 {
        self.read_us()
    }
}

/// Horloge pilotée à la main pour les tests
#[cfg(test)]
pub struct ManualClock {
    now: std::sync::atomic::AtomicU64,
}

#[cfg(test)]
impl ManualClock {
    pub fn new(start_us: u64) -> Self {
        ManualClock {
            now: std::sync::atomic::AtomicU64::new(start_us),
        }
    }

    pub fn set(&self, us: u64) {
        self.now.store(us, std::sync::atomic::Ordering::SeqCst);
    }

    pub fn advance(&self, us: u64) {
        self.now.fetch_add(us, std::sync::atomic::Ordering::SeqCst);
    }
}

#[cfg(test)]
impl MonotonicClock for ManualClock {
    fn now_us(&self) -> u64 {
        self.now.load(std::sync::atomic::Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_system_monotonic() {
        let clock = SystemMonotonic::new();
        let t1 = clock.now_us();
        std::thread::sleep(std::time::Duration::from_millis(10));
        let t2 = clock.now_us();

        // Le deuxième échantillon doit être plus grand
        assert!(t2 >= t1 + 5_000);
    }

    #[test]
    fn test_manual_clock() {
        let clock = ManualClock::new(1_000);
        clock.advance(500);
        assert_eq!(clock.now_us(), 1_500);
        clock.set(42);
        assert_eq!(clock.now_us(), 42);
    }
}
