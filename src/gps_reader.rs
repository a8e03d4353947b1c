/*!
Pilote série GPS avec reconnexion automatique et PPS via CTS

Ce thread joue le rôle des interruptions du microcontrôleur :
- chaque octet reçu est poussé dans le tampon circulaire (producteur unique)
- chaque front montant de la ligne CTS est horodaté dans `PpsCapture`

Il ne touche à rien d'autre : le découpage, le parsing et la discipline de
l'horloge sont faits par la boucle principale.
*/

use crate::clock::MonotonicClock;
use crate::config::GpsConfig;
use crate::line_framer::{Producer, RING_SIZE};
use crate::pps::PpsCapture;
use std::io::Read;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

const INITIAL_RECONNECT_DELAY: Duration = Duration::from_secs(5);
const MAX_RECONNECT_DELAY: Duration = Duration::from_secs(60);

/// Délai de reconnexion suivant (exponential backoff)
fn next_backoff(delay: Duration) -> Duration {
    std::cmp::min(delay * 2, MAX_RECONNECT_DELAY)
}

/// Détecteur de front montant sur une ligne de contrôle
#[derive(Debug, Clone, Copy)]
struct EdgeDetector {
    level: bool,
}

impl EdgeDetector {
    fn new(level: bool) -> Self {
        EdgeDetector { level }
    }

    /// Retourne vrai sur une transition bas → haut
    fn update(&mut self, level: bool) -> bool {
        let rising = level && !self.level;
        self.level = level;
        rising
    }
}

/// Gestionnaire de lecture GPS
pub struct GpsReader {
    config: GpsConfig,
    producer: Producer<RING_SIZE>,
    pps: Arc<PpsCapture>,
    clock: Arc<dyn MonotonicClock>,
    shutdown: Arc<AtomicBool>,
    bytes_received: u64,
}

impl GpsReader {
    pub fn new(
        config: GpsConfig,
        producer: Producer<RING_SIZE>,
        pps: Arc<PpsCapture>,
        clock: Arc<dyn MonotonicClock>,
        shutdown: Arc<AtomicBool>,
    ) -> Self {
        GpsReader {
            config,
            producer,
            pps,
            clock,
            shutdown,
            bytes_received: 0,
        }
    }

    /// Démarre le thread de lecture GPS
    /// Le thread tourne jusqu'à l'arrêt avec reconnexion automatique
    pub fn start(mut self) -> std::thread::JoinHandle<()> {
        info!("Starting GPS reader thread");
        info!("  Port: {}", self.config.serial_port);
        info!("  Baud rate: {}", self.config.baud_rate);
        info!("  PPS via CTS: {}", self.config.pps_enabled);

        std::thread::spawn(move || {
            let mut reconnect_delay = INITIAL_RECONNECT_DELAY;

            while !self.is_shutting_down() {
                match self.run_reader() {
                    Ok(()) => break,
                    Err(e) => {
                        error!("GPS reader error: {:#}", e);
                        error!("Reconnecting in {:?}...", reconnect_delay);

                        self.wait(reconnect_delay);
                        reconnect_delay = next_backoff(reconnect_delay);
                    }
                }
            }

            info!(
                "GPS reader thread terminated ({} bytes received, {} ring overflows)",
                self.bytes_received,
                self.producer.overflow_count()
            );
        })
    }

    fn is_shutting_down(&self) -> bool {
        self.shutdown.load(Ordering::Relaxed)
    }

    /// Attend `delay` en restant réactif à l'arrêt
    fn wait(&self, delay: Duration) {
        let deadline = Instant::now() + delay;
        while !self.is_shutting_down() && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(100));
        }
    }

    /// Boucle principale de lecture GPS
    fn run_reader(&mut self) -> anyhow::Result<()> {
        info!("Opening GPS serial port: {}", self.config.serial_port);

        let mut port = serialport::new(&self.config.serial_port, self.config.baud_rate)
            .timeout(Duration::from_millis(self.config.read_timeout_ms))
            .open()?;

        // Configuration des lignes de contrôle
        port.write_request_to_send(true)?;
        port.write_data_terminal_ready(true)?;
        port.clear(serialport::ClearBuffer::All)?;

        info!("GPS serial port opened successfully");

        let mut read_buf = [0u8; 512];
        let mut cts = EdgeDetector::new(port.read_clear_to_send()?);
        let mut last_stats_log = Instant::now();
        let mut pps_edges: u64 = 0;

        while !self.is_shutting_down() {
            match port.read(&mut read_buf) {
                Ok(n) if n > 0 => self.forward(&read_buf[..n]),
                Ok(_) => {}
                Err(ref e) if e.kind() == std::io::ErrorKind::TimedOut => {}
                Err(e) => return Err(e.into()),
            }

            // Détection du signal PPS via CTS (si activé)
            if self.config.pps_enabled {
                match port.read_clear_to_send() {
                    Ok(level) => {
                        if cts.update(level) {
                            self.pps.on_edge(self.clock.now_us());
                            pps_edges += 1;
                        }
                    }
                    Err(e) => warn!("Failed to read CTS status: {}", e),
                }
            }

            if last_stats_log.elapsed() > Duration::from_secs(60) {
                info!(
                    "GPS serial stats: {} bytes received, {} PPS edges on this connection",
                    self.bytes_received, pps_edges
                );
                last_stats_log = Instant::now();
            }
        }

        Ok(())
    }

    /// Pousse les octets reçus dans le tampon circulaire
    fn forward(&mut self, bytes: &[u8]) {
        let accepted = self.producer.push_slice(bytes);
        self.bytes_received += bytes.len() as u64;
        if accepted < bytes.len() {
            debug!("{} bytes dropped (ring full or cut sentence)", bytes.len() - accepted);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::line_framer::{LineFramer, RingBuffer, LINE_CAPACITY};

    fn config() -> GpsConfig {
        GpsConfig {
            serial_port: "/dev/null-gps".to_string(),
            baud_rate: 9600,
            read_timeout_ms: 2,
            pps_enabled: true,
        }
    }

    #[test]
    fn test_backoff() {
        let mut delay = INITIAL_RECONNECT_DELAY;
        let mut seen = Vec::new();
        for _ in 0..6 {
            seen.push(delay.as_secs());
            delay = next_backoff(delay);
        }
        assert_eq!(seen, vec![5, 10, 20, 40, 60, 60]);
    }

    #[test]
    fn test_cts_rising_edges_only() {
        let mut cts = EdgeDetector::new(false);
        let levels = [false, true, true, false, true, false, false, true];
        let edges: Vec<bool> = levels.iter().map(|&l| cts.update(l)).collect();
        assert_eq!(edges, vec![false, true, false, false, true, false, false, true]);

        // Ligne déjà haute à l'ouverture : pas de front
        let mut cts = EdgeDetector::new(true);
        assert!(!cts.update(true));
    }

    #[test]
    fn test_forward_feeds_framer() {
        let (producer, consumer) = RingBuffer::<RING_SIZE>::split();
        let clock: Arc<dyn MonotonicClock> = Arc::new(ManualClock::new(0));
        let mut reader = GpsReader::new(
            config(),
            producer,
            Arc::new(PpsCapture::new()),
            clock,
            Arc::new(AtomicBool::new(false)),
        );

        reader.forward(b"$GPZDA,123519,23,03,1994,00,00*");
        reader.forward(b"4C\r\n");
        assert_eq!(reader.bytes_received, 35);

        let mut framer = LineFramer::new(consumer);
        let mut out = [0u8; LINE_CAPACITY];
        assert_eq!(
            framer.try_read_line(&mut out),
            Some(&b"$GPZDA,123519,23,03,1994,00,00*4C"[..])
        );
    }

    #[test]
    fn test_open_failure_reconnects_until_shutdown() {
        let (producer, _consumer) = RingBuffer::<RING_SIZE>::split();
        let shutdown = Arc::new(AtomicBool::new(false));
        let reader = GpsReader::new(
            config(),
            producer,
            Arc::new(PpsCapture::new()),
            Arc::new(ManualClock::new(0)),
            Arc::clone(&shutdown),
        );

        let handle = reader.start();
        std::thread::sleep(Duration::from_millis(50));
        shutdown.store(true, Ordering::Relaxed);
        handle.join().unwrap();
    }
}
