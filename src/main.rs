mod clock;
mod config;
mod gps_reader;
mod gps_state;
mod line_framer;
mod nmea;
mod packet;
mod pps;
mod server;
mod status;
mod sync_loop;
mod timebase;
mod web_server;

use anyhow::{Context, Result};
use clock::{MonotonicClock, SystemMonotonic};
use config::Config;
use gps_reader::GpsReader;
use gps_state::SharedDeviceState;
use line_framer::{RingBuffer, RING_SIZE};
use pps::PpsCapture;
use server::{NtpServer, ServerStats};
use status::StatusBoard;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use sync_loop::SyncLoop;
use timebase::Timebase;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use web_server::WebServer;

fn main() -> Result<()> {
    // Le niveau de log vient de la configuration : elle est chargée d'abord
    let config_path = get_config_path();
    let (config, created) = load_or_create_config(&config_path)?;

    init_logging(&config.logging.level)?;

    info!("pps-ntpd v{}", env!("CARGO_PKG_VERSION"));
    info!("GPS/PPS-disciplined stratum 1 NTP server");

    if created {
        warn!("Configuration file not found, example created at {}", config_path.display());
        warn!("Please edit the configuration file and restart the server.");
    } else {
        info!("Configuration loaded from {}", config_path.display());
    }

    info!("Configuration:");
    info!("  NTP bind address: {}", config.server.bind_address);
    info!("  GPS serial port: {} @ {} baud", config.gps.serial_port, config.gps.baud_rate);
    info!("  PPS via CTS: {}", config.gps.pps_enabled);
    info!(
        "  PPS window: {}-{} ms, fresh < {} ms, lock age <= {} ms",
        config.timebase.pps_min_interval_ms,
        config.timebase.pps_max_interval_ms,
        config.timebase.pps_fresh_ms,
        config.timebase.lock_max_edge_age_ms
    );

    // Contexte partagé
    let clock: Arc<dyn MonotonicClock> = Arc::new(SystemMonotonic::new());
    let (producer, consumer) = RingBuffer::<RING_SIZE>::split();
    let pps = Arc::new(PpsCapture::new());
    let timebase = Arc::new(Timebase::new(Arc::clone(&clock), config.timebase.discipline()));
    let device_state = Arc::new(SharedDeviceState::new());
    let board = StatusBoard::new();
    let server_stats = Arc::new(ServerStats::new());
    let shutdown_requested = Arc::new(AtomicBool::new(false));

    // Thread série : octets NMEA + fronts PPS
    let gps_thread = GpsReader::new(
        config.gps.clone(),
        producer,
        Arc::clone(&pps),
        Arc::clone(&clock),
        Arc::clone(&shutdown_requested),
    )
    .start();

    // Thread NTP
    let server = NtpServer::new(
        config.server.bind_address.clone(),
        Arc::clone(&timebase),
        Arc::clone(&server_stats),
        config.logging.log_requests,
    );
    let ntp_thread = {
        let shutdown = Arc::clone(&shutdown_requested);
        std::thread::spawn(move || {
            if let Err(e) = server.run(shutdown) {
                error!("NTP server error: {:#}", e);
            }
        })
    };

    // Point d'accès d'état
    if config.webserver.enabled {
        let web_bind = config.webserver.socket_address();
        info!("Status endpoint on http://{}/api/status", web_bind);
        let _web_thread = WebServer::new(
            web_bind,
            board.clone(),
            Arc::clone(&timebase),
            Arc::clone(&device_state),
        )
        .start();
    }

    install_ctrlc_handler(Arc::clone(&shutdown_requested))?;
    info!("Press Ctrl+C twice (within 5 seconds) to stop");

    // Boucle principale
    let mut sync = SyncLoop::new(
        consumer,
        pps,
        timebase,
        device_state,
        board,
        server_stats,
    );
    sync.run(&shutdown_requested);

    if gps_thread.join().is_err() {
        error!("GPS reader thread panicked");
    }
    if ntp_thread.join().is_err() {
        error!("NTP server thread panicked");
    }

    info!("Shutdown complete");
    Ok(())
}

/// Initialise le système de logging
fn init_logging(level: &str) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .or_else(|_| EnvFilter::try_new("info"))
        .context("Failed to create log filter")?;

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false).with_thread_ids(false))
        .with(filter)
        .init();

    Ok(())
}

/// Gère Ctrl+C avec confirmation à double pression
fn install_ctrlc_handler(shutdown: Arc<AtomicBool>) -> Result<()> {
    let ctrl_c_count = Arc::new(AtomicU8::new(0));

    ctrlc::set_handler(move || {
        let count = ctrl_c_count.fetch_add(1, Ordering::SeqCst);

        if count == 0 {
            warn!("Ctrl+C detected. Press again within 5 seconds to stop the server.");

            // Désamorce après 5 secondes sans deuxième pression
            let count_disarm = Arc::clone(&ctrl_c_count);
            std::thread::spawn(move || {
                std::thread::sleep(std::time::Duration::from_secs(5));
                if count_disarm
                    .compare_exchange(1, 0, Ordering::SeqCst, Ordering::SeqCst)
                    .is_ok()
                {
                    info!("Shutdown cancelled, server keeps running.");
                }
            });
        } else {
            warn!("Shutdown confirmed. Stopping...");
            shutdown.store(true, Ordering::SeqCst);

            // Forcer la sortie si les threads ne répondent pas après 2 secondes
            std::thread::spawn(|| {
                std::thread::sleep(std::time::Duration::from_secs(2));
                error!("Forced exit (timeout)");
                std::process::exit(0);
            });
        }
    })
    .context("Failed to set Ctrl+C handler")
}

/// Obtient le chemin du fichier de configuration
fn get_config_path() -> PathBuf {
    if let Some(path) = std::env::args().nth(1) {
        return PathBuf::from(path);
    }

    #[cfg(target_os = "linux")]
    return PathBuf::from("/etc/pps-ntpd/config.toml");

    #[cfg(not(target_os = "linux"))]
    return PathBuf::from("config.toml");
}

/// Charge la configuration ou crée un fichier exemple.
/// Retourne vrai en second si le fichier vient d'être créé.
fn load_or_create_config(path: &Path) -> Result<(Config, bool)> {
    if path.exists() {
        return Ok((Config::from_file(path)?, false));
    }

    Config::create_example_config(path)
        .with_context(|| format!("Failed to create example config at {}", path.display()))?;

    Ok((Config::from_file(path)?, true))
}
