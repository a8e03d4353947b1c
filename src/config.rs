use crate::timebase::Discipline;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::net::SocketAddr;
use std::path::Path;

/// Configuration du serveur de temps
#[derive(Debug, Deserialize, Serialize, Clone, Default)]
pub struct Config {
    /// Configuration du serveur NTP
    #[serde(default)]
    pub server: ServerConfig,

    /// Configuration du récepteur GPS
    pub gps: GpsConfig,

    /// Seuils de discipline de la base de temps
    #[serde(default)]
    pub timebase: TimebaseConfig,

    /// Configuration des logs
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Configuration du point d'accès d'état
    #[serde(default)]
    pub webserver: WebServerConfig,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ServerConfig {
    /// Adresse d'écoute (ex: "0.0.0.0:123")
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct GpsConfig {
    /// Port série du module GPS (ex: "COM9" sur Windows, "/dev/ttyUSB0" sur Linux)
    pub serial_port: String,

    /// Baud rate (généralement 9600 pour NMEA)
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,

    /// Timeout de lecture série en millisecondes
    /// Court pour que la ligne CTS soit scrutée souvent
    #[serde(default = "default_read_timeout_ms")]
    pub read_timeout_ms: u64,

    /// Activer la détection PPS via CTS (Pulse Per Second)
    #[serde(default = "default_true")]
    pub pps_enabled: bool,
}

#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq)]
pub struct TimebaseConfig {
    /// Âge maximal d'un front PPS pour ancrer un fix GPS
    #[serde(default = "default_pps_fresh_ms")]
    pub pps_fresh_ms: u64,

    /// Intervalle PPS minimal accepté
    #[serde(default = "default_pps_min_interval_ms")]
    pub pps_min_interval_ms: u64,

    /// Intervalle PPS maximal accepté
    #[serde(default = "default_pps_max_interval_ms")]
    pub pps_max_interval_ms: u64,

    /// Âge maximal du dernier front pour l'état LOCKED
    #[serde(default = "default_lock_max_edge_age_ms")]
    pub lock_max_edge_age_ms: u64,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct LoggingConfig {
    /// Niveau de log: "trace", "debug", "info", "warn", "error"
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Activer les logs de chaque requête
    #[serde(default)]
    pub log_requests: bool,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct WebServerConfig {
    /// Activer le point d'accès d'état JSON
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Adresse d'écoute du serveur web
    #[serde(default = "default_web_bind_address")]
    pub bind_address: String,

    /// Port du serveur web
    #[serde(default = "default_web_port")]
    pub port: u16,
}

// Fonctions par défaut pour serde
fn default_bind_address() -> String { "0.0.0.0:123".to_string() }
fn default_baud_rate() -> u32 { 9600 }
fn default_read_timeout_ms() -> u64 { 2 }
fn default_true() -> bool { true }
fn default_pps_fresh_ms() -> u64 { 990 }
fn default_pps_min_interval_ms() -> u64 { 900 }
fn default_pps_max_interval_ms() -> u64 { 1100 }
fn default_lock_max_edge_age_ms() -> u64 { 1500 }
fn default_log_level() -> String { "info".to_string() }
fn default_web_port() -> u16 { 8080 }
fn default_web_bind_address() -> String { "0.0.0.0".to_string() }

#[cfg(target_os = "windows")]
fn default_serial_port() -> String { "COM9".to_string() }

#[cfg(not(target_os = "windows"))]
fn default_serial_port() -> String { "/dev/ttyUSB0".to_string() }

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            bind_address: default_bind_address(),
        }
    }
}

impl Default for GpsConfig {
    fn default() -> Self {
        GpsConfig {
            serial_port: default_serial_port(),
            baud_rate: default_baud_rate(),
            read_timeout_ms: default_read_timeout_ms(),
            pps_enabled: true,
        }
    }
}

impl Default for TimebaseConfig {
    fn default() -> Self {
        TimebaseConfig {
            pps_fresh_ms: default_pps_fresh_ms(),
            pps_min_interval_ms: default_pps_min_interval_ms(),
            pps_max_interval_ms: default_pps_max_interval_ms(),
            lock_max_edge_age_ms: default_lock_max_edge_age_ms(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            level: default_log_level(),
            log_requests: false,
        }
    }
}

impl Default for WebServerConfig {
    fn default() -> Self {
        WebServerConfig {
            enabled: true,
            bind_address: default_web_bind_address(),
            port: default_web_port(),
        }
    }
}

impl TimebaseConfig {
    /// Seuils en microsecondes pour la base de temps
    pub fn discipline(&self) -> Discipline {
        Discipline {
            pps_fresh_us: self.pps_fresh_ms * 1_000,
            pps_min_interval_us: self.pps_min_interval_ms * 1_000,
            pps_max_interval_us: self.pps_max_interval_ms * 1_000,
            lock_max_edge_age_us: self.lock_max_edge_age_ms * 1_000,
        }
    }
}

impl WebServerConfig {
    /// Adresse complète "ip:port"
    pub fn socket_address(&self) -> String {
        format!("{}:{}", self.bind_address, self.port)
    }
}

impl Config {
    /// Charge la configuration depuis un fichier TOML
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path.as_ref())
            .context("Failed to read config file")?;

        let config: Config = toml::from_str(&content)
            .context("Failed to parse config file")?;

        config.validate()?;
        Ok(config)
    }

    /// Sauvegarde la configuration dans un fichier TOML
    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)
            .context("Failed to serialize config")?;

        fs::write(path.as_ref(), content)
            .context("Failed to write config file")?;

        Ok(())
    }

    /// Valide la configuration
    fn validate(&self) -> Result<()> {
        self.server
            .bind_address
            .parse::<SocketAddr>()
            .with_context(|| format!("Invalid NTP bind address: {}", self.server.bind_address))?;

        if self.gps.serial_port.trim().is_empty() {
            anyhow::bail!("GPS serial port must not be empty");
        }
        if self.gps.baud_rate == 0 {
            anyhow::bail!("GPS baud rate must be greater than 0");
        }

        let tb = &self.timebase;
        if tb.pps_min_interval_ms >= tb.pps_max_interval_ms {
            anyhow::bail!(
                "Invalid PPS window: pps_min_interval_ms ({}) must be below pps_max_interval_ms ({})",
                tb.pps_min_interval_ms,
                tb.pps_max_interval_ms
            );
        }
        if tb.pps_fresh_ms == 0 || tb.pps_fresh_ms > 1000 {
            anyhow::bail!("Invalid pps_fresh_ms: must be between 1 and 1000");
        }

        if self.webserver.enabled {
            self.webserver
                .socket_address()
                .parse::<SocketAddr>()
                .with_context(|| {
                    format!("Invalid web server address: {}", self.webserver.socket_address())
                })?;
        }

        Ok(())
    }

    /// Crée un fichier de configuration exemple
    pub fn create_example_config<P: AsRef<Path>>(path: P) -> Result<()> {
        if let Some(parent) = path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).context("Failed to create config directory")?;
            }
        }

        Config::default().to_file(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.server.bind_address, "0.0.0.0:123");
        assert_eq!(config.gps.baud_rate, 9600);
        assert_eq!(config.gps.read_timeout_ms, 2);
        assert_eq!(config.webserver.socket_address(), "0.0.0.0:8080");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_discipline_from_config() {
        assert_eq!(TimebaseConfig::default().discipline(), Discipline::default());
    }

    #[test]
    fn test_parse_minimal_toml() {
        let config: Config = toml::from_str(
            r#"
            [gps]
            serial_port = "/dev/ttyAMA0"
            "#,
        )
        .unwrap();

        assert_eq!(config.gps.serial_port, "/dev/ttyAMA0");
        assert!(config.gps.pps_enabled);
        assert_eq!(config.timebase.pps_fresh_ms, 990);
        assert_eq!(config.logging.level, "info");
        assert!(config.webserver.enabled);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_full_toml() {
        let config: Config = toml::from_str(
            r#"
            [server]
            bind_address = "127.0.0.1:1123"

            [gps]
            serial_port = "COM3"
            baud_rate = 38400
            read_timeout_ms = 5
            pps_enabled = false

            [timebase]
            pps_fresh_ms = 800
            pps_min_interval_ms = 950
            pps_max_interval_ms = 1050
            lock_max_edge_age_ms = 2000

            [logging]
            level = "debug"
            log_requests = true

            [webserver]
            enabled = false
            bind_address = "127.0.0.1"
            port = 9090
            "#,
        )
        .unwrap();

        assert_eq!(config.server.bind_address, "127.0.0.1:1123");
        assert_eq!(config.gps.baud_rate, 38400);
        assert!(!config.gps.pps_enabled);
        assert_eq!(config.timebase.discipline().pps_min_interval_us, 950_000);
        assert_eq!(config.timebase.discipline().lock_max_edge_age_us, 2_000_000);
        assert!(config.logging.log_requests);
        assert!(!config.webserver.enabled);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let mut config = Config::default();
        config.server.bind_address = "not-an-address".to_string();
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.gps.serial_port = "  ".to_string();
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.gps.baud_rate = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.timebase.pps_min_interval_ms = 1100;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.timebase.pps_fresh_ms = 1001;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.webserver.port = 0;
        assert!(config.validate().is_ok());
        config.webserver.bind_address = "localhost".to_string();
        assert!(config.validate().is_err());
        config.webserver.enabled = false;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_example_config_round_trip() {
        let dir = std::env::temp_dir().join(format!("pps-ntpd-config-{}", std::process::id()));
        let path = dir.join("config.toml");

        Config::create_example_config(&path).unwrap();
        let loaded = Config::from_file(&path).unwrap();
        assert_eq!(loaded.server.bind_address, "0.0.0.0:123");
        assert_eq!(loaded.timebase, TimebaseConfig::default());

        fs::remove_dir_all(&dir).unwrap();
    }
}
