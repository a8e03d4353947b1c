use crate::packet::{LeapIndicator, NtpMode, NtpPacket};
use crate::timebase::Timebase;
use anyhow::{Context, Result};
use serde::Serialize;
use std::net::{SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, trace};

/// Intervalle entre deux logs de statistiques
const STATS_LOG_INTERVAL: Duration = Duration::from_secs(60);

/// Compteurs du serveur NTP, lus ensemble
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct NtpCounters {
    pub received: u64,
    pub responded: u64,
    pub dropped: u64,
    pub errors: u64,
}

/// Statistiques du serveur
pub struct ServerStats {
    /// Vrai entre un bind réussi et l'arrêt du serveur
    pub running: AtomicBool,
    pub requests_received: AtomicU64,
    pub requests_responded: AtomicU64,
    pub requests_dropped: AtomicU64,
    pub errors: AtomicU64,
}

impl ServerStats {
    pub fn new() -> Self {
        ServerStats {
            running: AtomicBool::new(false),
            requests_received: AtomicU64::new(0),
            requests_responded: AtomicU64::new(0),
            requests_dropped: AtomicU64::new(0),
            errors: AtomicU64::new(0),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn counters(&self) -> NtpCounters {
        NtpCounters {
            received: self.requests_received.load(Ordering::Relaxed),
            responded: self.requests_responded.load(Ordering::Relaxed),
            dropped: self.requests_dropped.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
        }
    }

    pub fn log_stats(&self) {
        let c = self.counters();
        info!(
            "Stats: received={}, responded={}, dropped={}, errors={}",
            c.received, c.responded, c.dropped, c.errors
        );
    }
}

impl Default for ServerStats {
    fn default() -> Self {
        Self::new()
    }
}

/// Serveur NTP stratum 1 adossé à la base de temps GPS
pub struct NtpServer {
    bind_address: String,
    timebase: Arc<Timebase>,
    stats: Arc<ServerStats>,
    log_requests: bool,
}

impl NtpServer {
    pub fn new(
        bind_address: String,
        timebase: Arc<Timebase>,
        stats: Arc<ServerStats>,
        log_requests: bool,
    ) -> Self {
        NtpServer {
            bind_address,
            timebase,
            stats,
            log_requests,
        }
    }

    /// Démarre le serveur NTP
    pub fn run(&self, shutdown: Arc<AtomicBool>) -> Result<()> {
        let socket = UdpSocket::bind(&self.bind_address)
            .with_context(|| format!("Failed to bind UDP socket on {}", self.bind_address))?;

        // Timeout sur recv_from afin de pouvoir vérifier le shutdown flag
        socket
            .set_read_timeout(Some(Duration::from_millis(500)))
            .context("Failed to set socket read timeout")?;

        self.stats.running.store(true, Ordering::Release);
        info!("NTP server listening on {}", self.bind_address);

        self.serve(&socket, &shutdown);

        self.stats.running.store(false, Ordering::Release);
        self.stats.log_stats();
        info!("NTP server stopped");
        Ok(())
    }

    /// Boucle de réception jusqu'à la demande d'arrêt
    fn serve(&self, socket: &UdpSocket, shutdown: &AtomicBool) {
        let mut buffer = [0u8; 512];
        let mut last_stats_log = Instant::now();

        loop {
            if shutdown.load(Ordering::Relaxed) {
                info!("Shutdown signal received, stopping NTP server...");
                break;
            }

            if last_stats_log.elapsed() >= STATS_LOG_INTERVAL {
                self.stats.log_stats();
                last_stats_log = Instant::now();
            }

            let (size, client_addr) = match socket.recv_from(&mut buffer) {
                Ok(received) => received,
                Err(e)
                    if e.kind() == std::io::ErrorKind::WouldBlock
                        || e.kind() == std::io::ErrorKind::TimedOut =>
                {
                    continue;
                }
                Err(e) => {
                    error!("Error receiving NTP request: {}", e);
                    self.stats.errors.fetch_add(1, Ordering::Relaxed);
                    continue;
                }
            };

            self.handle_datagram(socket, &buffer[..size], client_addr);
        }
    }

    fn handle_datagram(&self, socket: &UdpSocket, datagram: &[u8], client_addr: SocketAddr) {
        self.stats.requests_received.fetch_add(1, Ordering::Relaxed);

        let Some(response) = self.respond(datagram) else {
            self.stats.requests_dropped.fetch_add(1, Ordering::Relaxed);
            if self.log_requests {
                debug!("NTP request from {} dropped ({} bytes)", client_addr, datagram.len());
            }
            return;
        };

        match socket.send_to(&response, client_addr) {
            Ok(_) => {
                self.stats.requests_responded.fetch_add(1, Ordering::Relaxed);
                if self.log_requests {
                    debug!("NTP response sent to {}", client_addr);
                }
            }
            Err(e) => {
                error!("Failed to send NTP response to {}: {}", client_addr, e);
                self.stats.errors.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// Construit la réponse à un datagramme client.
    ///
    /// None si le datagramme est trop court, n'est pas en mode client,
    /// ou si la base de temps n'a pas encore de référence.
    pub fn respond(&self, datagram: &[u8]) -> Option<[u8; NtpPacket::SIZE]> {
        let request = match NtpPacket::from_bytes(datagram) {
            Ok(packet) => packet,
            Err(e) => {
                trace!("Ignoring datagram: {}", e);
                return None;
            }
        };

        if request.mode != NtpMode::Client {
            trace!("Ignoring NTP packet in mode {:?}", request.mode);
            return None;
        }

        // T2 : le plus tôt possible après la réception
        let receive_time = self.timebase.now_ntp()?;
        let status = self.timebase.status();

        let mut response = NtpPacket::new_server_response();

        response.version = match request.version {
            3 | 4 => request.version,
            _ => 4,
        };
        response.leap_indicator = if status.synced {
            LeapIndicator::NoWarning
        } else {
            LeapIndicator::AlarmCondition
        };
        response.stratum = match (status.have_time, status.synced) {
            (true, true) => 1,
            (true, false) => 2,
            _ => 16,
        };
        response.poll = request.poll;

        // Stratum 1 : la dernière référence est l'instant présent
        response.reference_timestamp = receive_time;
        response.originate_timestamp = request.transmit_timestamp;
        response.receive_timestamp = receive_time;

        // T3 : le plus tard possible avant l'envoi
        response.transmit_timestamp = self.timebase.now_ntp()?;

        Some(response.to_bytes())
    }

    /// Retourne les statistiques du serveur
    #[allow(dead_code)]
    pub fn stats(&self) -> &Arc<ServerStats> {
        &self.stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::packet::NtpTimestamp;
    use crate::pps::PpsSnapshot;
    use crate::timebase::{Discipline, NTP_UNIX_OFFSET};

    const T0: u64 = 764_426_119;

    fn server() -> (Arc<ManualClock>, Arc<Timebase>, NtpServer) {
        let clock = Arc::new(ManualClock::new(10_000_000));
        let timebase = Arc::new(Timebase::new(clock.clone(), Discipline::default()));
        let server = NtpServer::new(
            "127.0.0.1:0".to_string(),
            Arc::clone(&timebase),
            Arc::new(ServerStats::new()),
            true,
        );
        (clock, timebase, server)
    }

    fn client_request(version: u8, transmit: u64) -> [u8; NtpPacket::SIZE] {
        let mut bytes = [0u8; NtpPacket::SIZE];
        bytes[0] = (version << 3) | 3;
        bytes[2] = 6;
        bytes[40..48].copy_from_slice(&transmit.to_be_bytes());
        bytes
    }

    #[test]
    fn test_no_response_without_time() {
        let (_clock, _timebase, server) = server();
        assert!(server.respond(&client_request(4, 1)).is_none());
    }

    #[test]
    fn test_response_shape() {
        let (clock, timebase, server) = server();
        timebase.on_gps_fix(T0, PpsSnapshot::default());
        clock.set(10_250_000);

        let request = client_request(4, 0xDEAD_BEEF_0000_0001);
        let bytes = server.respond(&request).unwrap();
        let response = NtpPacket::from_bytes(&bytes).unwrap();

        assert_eq!(response.mode, NtpMode::Server);
        assert_eq!(response.version, 4);
        assert_eq!(response.leap_indicator, LeapIndicator::NoWarning);
        assert_eq!(response.stratum, 1);
        assert_eq!(response.poll, 6);
        assert_eq!(response.precision, -20);
        assert_eq!(response.root_delay, 0);
        assert_eq!(response.root_dispersion, 0);
        assert_eq!(&bytes[12..16], b"GPS\0");
        assert_eq!(response.originate_timestamp.0, 0xDEAD_BEEF_0000_0001);

        let expected = NtpTimestamp::from_unix(T0, 250_000);
        assert_eq!(response.receive_timestamp, expected);
        assert_eq!(response.reference_timestamp, expected);
        assert_eq!(response.transmit_timestamp, expected);
        assert_eq!(response.transmit_timestamp.seconds() as u64, T0 + NTP_UNIX_OFFSET);
    }

    #[test]
    fn test_version_echo() {
        let (_clock, timebase, server) = server();
        timebase.on_gps_fix(T0, PpsSnapshot::default());

        for (requested, answered) in [(1u8, 4u8), (2, 4), (3, 3), (4, 4), (5, 4), (7, 4)] {
            let bytes = server.respond(&client_request(requested, 1)).unwrap();
            assert_eq!((bytes[0] >> 3) & 0x07, answered);
            assert_eq!(bytes[0] & 0x07, 4);
        }
    }

    #[test]
    fn test_dropped_requests() {
        let (_clock, timebase, server) = server();
        timebase.on_gps_fix(T0, PpsSnapshot::default());

        assert!(server.respond(&client_request(4, 1)[..47]).is_none());
        assert!(server.respond(&[]).is_none());

        for mode in [0u8, 1, 2, 4, 5, 6, 7] {
            let mut request = client_request(4, 1);
            request[0] = (4 << 3) | mode;
            assert!(server.respond(&request).is_none());
        }

        // Les octets au-delà de 48 sont ignorés
        let mut long = [0u8; 68];
        long[..48].copy_from_slice(&client_request(4, 1));
        assert!(server.respond(&long).is_some());
    }

    #[test]
    fn test_no_response_after_clear() {
        let (_clock, timebase, server) = server();
        timebase.on_gps_fix(T0, PpsSnapshot::default());
        assert!(server.respond(&client_request(4, 1)).is_some());

        timebase.clear();
        assert!(server.respond(&client_request(4, 1)).is_none());
    }

    #[test]
    fn test_serve_over_udp() {
        let (_clock, timebase, server) = server();
        timebase.on_gps_fix(T0, PpsSnapshot::default());

        let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
        socket.set_read_timeout(Some(Duration::from_millis(50))).unwrap();
        let server_addr = socket.local_addr().unwrap();
        let shutdown = Arc::new(AtomicBool::new(false));

        let handle = {
            let shutdown = Arc::clone(&shutdown);
            std::thread::spawn(move || {
                server.serve(&socket, &shutdown);
                server
            })
        };

        let client = UdpSocket::bind("127.0.0.1:0").unwrap();
        client.set_read_timeout(Some(Duration::from_secs(2))).unwrap();

        client.send_to(&[0x1B; 10], server_addr).unwrap();
        client.send_to(&client_request(4, 42), server_addr).unwrap();

        let mut reply = [0u8; 64];
        let (size, _) = client.recv_from(&mut reply).unwrap();
        assert_eq!(size, NtpPacket::SIZE);
        assert_eq!(reply[0] & 0x07, 4);
        assert_eq!(u64::from_be_bytes(reply[24..32].try_into().unwrap()), 42);

        shutdown.store(true, Ordering::Relaxed);
        let server = handle.join().unwrap();

        let counters = server.stats().counters();
        assert_eq!(counters.received, 2);
        assert_eq!(counters.responded, 1);
        assert_eq!(counters.dropped, 1);
        assert_eq!(counters.errors, 0);
    }

    #[test]
    fn test_run_sets_running_flag() {
        let (_clock, _timebase, server) = server();
        let stats = Arc::clone(server.stats());
        let shutdown = Arc::new(AtomicBool::new(false));

        let handle = {
            let shutdown = Arc::clone(&shutdown);
            std::thread::spawn(move || server.run(shutdown))
        };

        let deadline = Instant::now() + Duration::from_secs(2);
        while !stats.is_running() && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        assert!(stats.is_running());

        shutdown.store(true, Ordering::Relaxed);
        handle.join().unwrap().unwrap();
        assert!(!stats.is_running());
    }

    #[test]
    fn test_bind_failure_leaves_flag_clear() {
        let (_clock, timebase, _server) = server();
        let server = NtpServer::new(
            "not an address".to_string(),
            timebase,
            Arc::new(ServerStats::new()),
            false,
        );

        assert!(server.run(Arc::new(AtomicBool::new(false))).is_err());
        assert!(!server.stats().is_running());
    }
}
