use crate::timebase::NTP_UNIX_OFFSET;
use thiserror::Error;

/// Erreurs liées au décodage des paquets NTP
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum NtpError {
    #[error("Invalid packet size: expected at least {expected}, got {actual}")]
    InvalidSize { expected: usize, actual: usize },
}

/// Leap Indicator values
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeapIndicator {
    NoWarning = 0,
    LastMinute61Seconds = 1,
    LastMinute59Seconds = 2,
    /// Horloge non synchronisée
    AlarmCondition = 3,
}

impl From<u8> for LeapIndicator {
    fn from(value: u8) -> Self {
        match value & 0b11 {
            0 => LeapIndicator::NoWarning,
            1 => LeapIndicator::LastMinute61Seconds,
            2 => LeapIndicator::LastMinute59Seconds,
            _ => LeapIndicator::AlarmCondition,
        }
    }
}

/// NTP Mode values
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NtpMode {
    Reserved = 0,
    SymmetricActive = 1,
    SymmetricPassive = 2,
    Client = 3,
    Server = 4,
    Broadcast = 5,
    NtpControlMessage = 6,
    ReservedPrivate = 7,
}

impl From<u8> for NtpMode {
    fn from(value: u8) -> Self {
        match value & 0x07 {
            0 => NtpMode::Reserved,
            1 => NtpMode::SymmetricActive,
            2 => NtpMode::SymmetricPassive,
            3 => NtpMode::Client,
            4 => NtpMode::Server,
            5 => NtpMode::Broadcast,
            6 => NtpMode::NtpControlMessage,
            _ => NtpMode::ReservedPrivate,
        }
    }
}

/// Structure représentant un timestamp NTP (64 bits)
/// Format: 32 bits de secondes depuis 1900 + 32 bits de fraction
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NtpTimestamp(pub u64);

impl NtpTimestamp {
    /// Crée un timestamp NTP à partir d'un temps Unix (secondes + microsecondes)
    pub fn from_unix(unix_seconds: u64, micros: u32) -> Self {
        let seconds = unix_seconds.wrapping_add(NTP_UNIX_OFFSET) & 0xFFFF_FFFF;
        let fraction = ((micros as u64) << 32) / 1_000_000;
        NtpTimestamp((seconds << 32) | fraction)
    }

    /// Retourne la partie secondes du timestamp
    pub fn seconds(&self) -> u32 {
        (self.0 >> 32) as u32
    }

    /// Retourne la partie fraction du timestamp
    pub fn fraction(&self) -> u32 {
        self.0 as u32
    }
}

/// Structure du paquet NTP (48 octets)
/// Tous les champs multi-octets sont en big-endian (network byte order)
#[derive(Debug, Clone, Copy)]
pub struct NtpPacket {
    // Octet 0
    pub leap_indicator: LeapIndicator,
    pub version: u8,
    pub mode: NtpMode,

    // Octet 1-3
    pub stratum: u8,
    pub poll: i8,
    pub precision: i8,

    // Octets 4-7
    pub root_delay: u32,

    // Octets 8-11
    pub root_dispersion: u32,

    // Octets 12-15
    pub reference_identifier: u32,

    // Octets 16-23
    pub reference_timestamp: NtpTimestamp,

    // Octets 24-31
    pub originate_timestamp: NtpTimestamp,

    // Octets 32-39
    pub receive_timestamp: NtpTimestamp,

    // Octets 40-47
    pub transmit_timestamp: NtpTimestamp,
}

fn read_u32(bytes: &[u8], at: usize) -> u32 {
    let mut word = [0u8; 4];
    word.copy_from_slice(&bytes[at..at + 4]);
    u32::from_be_bytes(word)
}

fn read_timestamp(bytes: &[u8], at: usize) -> NtpTimestamp {
    let mut word = [0u8; 8];
    word.copy_from_slice(&bytes[at..at + 8]);
    NtpTimestamp(u64::from_be_bytes(word))
}

impl NtpPacket {
    /// Taille du paquet NTP en octets
    pub const SIZE: usize = 48;

    /// Identifiant de référence "GPS\0"
    pub const REFERENCE_GPS: u32 = u32::from_be_bytes(*b"GPS\0");

    /// Crée un paquet de réponse serveur par défaut
    pub fn new_server_response() -> Self {
        NtpPacket {
            leap_indicator: LeapIndicator::NoWarning,
            version: 4,
            mode: NtpMode::Server,
            stratum: 1, // Stratum 1 = source primaire (GPS)
            poll: 4,
            precision: -20, // 2^-20 ≈ 1 microseconde
            root_delay: 0,
            root_dispersion: 0,
            reference_identifier: Self::REFERENCE_GPS,
            reference_timestamp: NtpTimestamp::default(),
            originate_timestamp: NtpTimestamp::default(),
            receive_timestamp: NtpTimestamp::default(),
            transmit_timestamp: NtpTimestamp::default(),
        }
    }

    /// Décode un datagramme. Seule la taille est vérifiée, le filtrage
    /// sur le mode et la version revient au serveur.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, NtpError> {
        if bytes.len() < Self::SIZE {
            return Err(NtpError::InvalidSize {
                expected: Self::SIZE,
                actual: bytes.len(),
            });
        }

        // Octet 0: LI (2 bits) + VN (3 bits) + Mode (3 bits)
        let li_vn_mode = bytes[0];

        Ok(NtpPacket {
            leap_indicator: LeapIndicator::from(li_vn_mode >> 6),
            version: (li_vn_mode >> 3) & 0x07,
            mode: NtpMode::from(li_vn_mode),
            stratum: bytes[1],
            poll: bytes[2] as i8,
            precision: bytes[3] as i8,
            root_delay: read_u32(bytes, 4),
            root_dispersion: read_u32(bytes, 8),
            reference_identifier: read_u32(bytes, 12),
            reference_timestamp: read_timestamp(bytes, 16),
            originate_timestamp: read_timestamp(bytes, 24),
            receive_timestamp: read_timestamp(bytes, 32),
            transmit_timestamp: read_timestamp(bytes, 40),
        })
    }

    /// Convertit le paquet en bytes pour transmission (big-endian)
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut bytes = [0u8; Self::SIZE];

        // Octet 0: LI + VN + Mode
        bytes[0] = ((self.leap_indicator as u8) << 6)
            | ((self.version & 0x07) << 3)
            | (self.mode as u8 & 0x07);

        // Octets 1-3
        bytes[1] = self.stratum;
        bytes[2] = self.poll as u8;
        bytes[3] = self.precision as u8;

        bytes[4..8].copy_from_slice(&self.root_delay.to_be_bytes());
        bytes[8..12].copy_from_slice(&self.root_dispersion.to_be_bytes());
        bytes[12..16].copy_from_slice(&self.reference_identifier.to_be_bytes());

        bytes[16..24].copy_from_slice(&self.reference_timestamp.0.to_be_bytes());
        bytes[24..32].copy_from_slice(&self.originate_timestamp.0.to_be_bytes());
        bytes[32..40].copy_from_slice(&self.receive_timestamp.0.to_be_bytes());
        bytes[40..48].copy_from_slice(&self.transmit_timestamp.0.to_be_bytes());

        bytes
    }
}
