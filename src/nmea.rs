/*!
Parser NMEA 0183 minimal (RMC, GGA, ZDA)

Seules les trames utiles à la synchronisation sont reconnues :
- **RMC** : heure, statut de validité, date → alimente la base de temps
- **GGA** : qualité du fix, nombre de satellites, HDOP
- **ZDA** : date et heure complètes (affichage uniquement)

L'identifiant d'émetteur (GP, GN, GL...) est ignoré. Le checksum est
accepté mais pas vérifié.

Format typique d'une trame GPRMC :
```text
$GPRMC,123519,A,4807.038,N,01131.000,E,022.4,084.4,230394,003.1,W*6A
       hhmmss   latitude     longitude  speed course date
```

Aucune allocation : les textes sont copiés dans des `heapless::String`.
*/

use heapless::String;
use serde::Serialize;
use std::fmt::{self, Write};
use thiserror::Error;
use tracing::{debug, trace};

/// Taille du tampon de conversion des champs numériques
const SCRATCH_LEN: usize = 15;

/// Erreurs de parsing d'une trame NMEA
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum NmeaError {
    #[error("line does not start with '$'")]
    NotASentence,

    #[error("sentence contains non-ASCII bytes")]
    NotAscii,

    #[error("unsupported sentence type")]
    Unsupported,

    #[error("missing field {0}")]
    MissingField(usize),

    #[error("invalid time field")]
    BadTime,

    #[error("invalid date field")]
    BadDate,

    #[error("invalid numeric field {0}")]
    BadNumber(usize),
}

/// Types de trames reconnus
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SentenceKind {
    Rmc,
    Gga,
    Zda,
}

impl SentenceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SentenceKind::Rmc => "RMC",
            SentenceKind::Gga => "GGA",
            SentenceKind::Zda => "ZDA",
        }
    }
}

/// Trame découpée, empruntant la ligne d'origine
#[derive(Debug, Clone, Copy)]
pub struct Sentence<'a> {
    pub kind: SentenceKind,
    /// Contenu avant le '*' du checksum (ou toute la ligne)
    payload: &'a str,
}

impl<'a> Sentence<'a> {
    /// Identifie une ligne `$ttXXX,...`
    pub fn parse(line: &'a [u8]) -> Result<Self, NmeaError> {
        if line.first() != Some(&b'$') {
            return Err(NmeaError::NotASentence);
        }
        if !line.is_ascii() {
            return Err(NmeaError::NotAscii);
        }
        let line = std::str::from_utf8(line).map_err(|_| NmeaError::NotAscii)?;

        // '$' + 2 lettres d'émetteur + 3 lettres de type + ','
        let kind = match line.get(3..7) {
            Some("RMC,") => SentenceKind::Rmc,
            Some("GGA,") => SentenceKind::Gga,
            Some("ZDA,") => SentenceKind::Zda,
            _ => return Err(NmeaError::Unsupported),
        };

        // Un champ se termine à la virgule suivante, au '*' ou en fin de ligne
        let end = line
            .find(|c| c == '*' || c == '\r' || c == '\n')
            .unwrap_or(line.len());

        Ok(Sentence {
            kind,
            payload: &line[..end],
        })
    }

    /// Retourne le champ `index` s'il est présent et non vide
    pub fn field(&self, index: usize) -> Option<&'a str> {
        self.payload.split(',').nth(index).filter(|f| !f.is_empty())
    }
}

/// Date et heure UTC civiles extraites d'une trame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CivilDateTime {
    pub year: i32,
    pub month: u8,
    pub day: u8,
    pub hour: u8,
    pub minute: u8,
    pub second: u8,
}

impl CivilDateTime {
    /// Secondes Unix (UTC), calendrier grégorien proleptique
    pub fn unix_seconds(&self) -> i64 {
        let days = days_from_civil(self.year, self.month, self.day);
        days * 86_400
            + i64::from(self.hour) * 3_600
            + i64::from(self.minute) * 60
            + i64::from(self.second)
    }
}

impl fmt::Display for CivilDateTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:04}-{:02}-{:02} {:02}:{:02}:{:02}Z",
            self.year, self.month, self.day, self.hour, self.minute, self.second
        )
    }
}

/// Nombre de jours depuis 1970-01-01 (algorithme "days from civil" de H. Hinnant)
pub fn days_from_civil(year: i32, month: u8, day: u8) -> i64 {
    let m = i64::from(month);
    let d = i64::from(day);
    let y = i64::from(year) - i64::from(m <= 2);

    let era = (if y >= 0 { y } else { y - 399 }) / 400;
    let yoe = y - era * 400; // [0, 399]
    let mp = if m > 2 { m - 3 } else { m + 9 };
    let doy = (153 * mp + 2) / 5 + d - 1; // [0, 365]
    let doe = yoe * 365 + yoe / 4 - yoe / 100 + doy; // [0, 146096]

    era * 146_097 + doe - 719_468
}

fn all_digits(s: &[u8]) -> bool {
    s.iter().all(u8::is_ascii_digit)
}

fn two_digits(s: &[u8]) -> u8 {
    (s[0] - b'0') * 10 + (s[1] - b'0')
}

/// "hhmmss" ou "hhmmss.sss" → (h, m, s), fraction ignorée
fn parse_hhmmss(s: &str) -> Result<(u8, u8, u8), NmeaError> {
    let b = s.as_bytes();
    if b.len() < 6 || !all_digits(&b[..6]) {
        return Err(NmeaError::BadTime);
    }

    let (hh, mm, ss) = (two_digits(&b[0..2]), two_digits(&b[2..4]), two_digits(&b[4..6]));

    // 60 autorisé pour une seconde intercalaire
    if hh > 23 || mm > 59 || ss > 60 {
        return Err(NmeaError::BadTime);
    }
    Ok((hh, mm, ss))
}

/// Années sur deux chiffres : 80..99 → 1980..1999, 00..79 → 2000..2079
fn expand_two_digit_year(yy: u8) -> i32 {
    if yy >= 80 {
        1900 + i32::from(yy)
    } else {
        2000 + i32::from(yy)
    }
}

fn check_month_day(month: u8, day: u8) -> Result<(), NmeaError> {
    if !(1..=12).contains(&month) || !(1..=31).contains(&day) {
        return Err(NmeaError::BadDate);
    }
    Ok(())
}

/// "ddmmyy" → (année, mois, jour)
fn parse_ddmmyy(s: &str) -> Result<(i32, u8, u8), NmeaError> {
    let b = s.as_bytes();
    if b.len() != 6 || !all_digits(b) {
        return Err(NmeaError::BadDate);
    }

    let day = two_digits(&b[0..2]);
    let month = two_digits(&b[2..4]);
    check_month_day(month, day)?;

    Ok((expand_two_digit_year(two_digits(&b[4..6])), month, day))
}

/// Copie un champ brut en tronquant à la capacité
fn copy_truncated<const N: usize>(dst: &mut String<N>, src: &str) {
    dst.clear();
    for c in src.chars() {
        if dst.push(c).is_err() {
            break;
        }
    }
}

/// Copie bornée d'un champ numérique, refusée s'il est trop long
fn scratch_copy(field: &str, index: usize) -> Result<String<SCRATCH_LEN>, NmeaError> {
    let mut scratch = String::new();
    scratch
        .push_str(field)
        .map_err(|_| NmeaError::BadNumber(index))?;
    Ok(scratch)
}

fn parse_u32_field(field: &str, index: usize) -> Result<u32, NmeaError> {
    scratch_copy(field, index)?
        .parse::<u32>()
        .map_err(|_| NmeaError::BadNumber(index))
}

fn parse_f32_field(field: &str, index: usize) -> Result<f32, NmeaError> {
    let value = scratch_copy(field, index)?
        .parse::<f32>()
        .map_err(|_| NmeaError::BadNumber(index))?;
    if !value.is_finite() {
        return Err(NmeaError::BadNumber(index));
    }
    Ok(value)
}

/// Résultat d'une trame acceptée
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Parsed {
    pub kind: SentenceKind,
    /// Secondes Unix UTC d'un fix RMC valide, à transmettre à la base de temps
    pub utc_fix: Option<u64>,
}

/// État GPS tel que connu d'après les dernières trames reçues
///
/// Un champ n'est modifié que si le champ correspondant de la trame est
/// présent et valide : un champ absent n'efface jamais une valeur connue.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct GpsStatus {
    /// Statut RMC 'A'
    pub rmc_valid: bool,

    /// Qualité GGA entre 1 et 8
    pub gga_fix: bool,

    /// Nombre de satellites utilisés (None = inconnu)
    pub satellites: Option<u32>,

    /// Dilution horizontale de précision (None = inconnue)
    pub hdop: Option<f32>,

    /// Heure RMC brute "hhmmss[.sss]"
    pub last_rmc_time: String<16>,

    /// Date RMC brute "ddmmyy"
    pub last_rmc_date: String<16>,

    /// Dernière date/heure ZDA "YYYY-MM-DD HH:MM:SSZ"
    pub last_zda: String<32>,
}

impl GpsStatus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Applique une ligne NMEA au statut
    ///
    /// `Err` signifie que la trame a été rejetée et que rien n'a changé.
    /// `Ok` peut laisser certains champs inchangés s'ils étaient invalides.
    pub fn update_from_nmea(&mut self, line: &[u8]) -> Result<Parsed, NmeaError> {
        let sentence = Sentence::parse(line)?;
        trace!("NMEA {}: {}", sentence.kind.as_str(), sentence.payload);

        let utc_fix = match sentence.kind {
            SentenceKind::Rmc => self.apply_rmc(&sentence),
            SentenceKind::Gga => {
                self.apply_gga(&sentence);
                None
            }
            SentenceKind::Zda => {
                self.apply_zda(&sentence)?;
                None
            }
        };

        Ok(Parsed {
            kind: sentence.kind,
            utc_fix,
        })
    }

    /// RMC : champ 1 heure, 2 statut, 9 date
    fn apply_rmc(&mut self, sentence: &Sentence<'_>) -> Option<u64> {
        let time = sentence.field(1);
        let status = sentence.field(2);
        let date = sentence.field(9);

        if let Some(t) = time {
            copy_truncated(&mut self.last_rmc_time, t);
        }
        if let Some(d) = date {
            copy_truncated(&mut self.last_rmc_date, d);
        }
        if let Some(s) = status {
            self.rmc_valid = s == "A";
        }

        if !self.rmc_valid || time.is_none() || date.is_none() {
            return None;
        }

        let parsed = parse_hhmmss(&self.last_rmc_time).and_then(|(hour, minute, second)| {
            let (year, month, day) = parse_ddmmyy(&self.last_rmc_date)?;
            Ok(CivilDateTime {
                year,
                month,
                day,
                hour,
                minute,
                second,
            })
        });

        match parsed {
            Ok(utc) => {
                let unix = utc.unix_seconds();
                if unix < 0 {
                    return None;
                }
                debug!("RMC fix {} (unix {})", utc, unix);
                Some(unix as u64)
            }
            Err(e) => {
                debug!("RMC time not usable: {}", e);
                None
            }
        }
    }

    /// GGA : champ 6 qualité, 7 satellites, 8 HDOP
    fn apply_gga(&mut self, sentence: &Sentence<'_>) {
        if let Some(q) = sentence.field(6) {
            self.gga_fix = matches!(q.as_bytes()[0], b'1'..=b'8');
        }

        if let Some(f) = sentence.field(7) {
            match parse_u32_field(f, 7) {
                Ok(n) => self.satellites = Some(n),
                Err(e) => debug!("GGA satellites rejected: {}", e),
            }
        }

        if let Some(f) = sentence.field(8) {
            match parse_f32_field(f, 8) {
                Ok(h) => self.hdop = Some(h),
                Err(e) => debug!("GGA HDOP rejected: {}", e),
            }
        }
    }

    /// ZDA : champs 1 heure, 2 jour, 3 mois, 4 année, sans effet sur la base de temps
    fn apply_zda(&mut self, sentence: &Sentence<'_>) -> Result<(), NmeaError> {
        let mut fields = [""; 4];
        for (i, slot) in fields.iter_mut().enumerate() {
            *slot = sentence.field(i + 1).ok_or(NmeaError::MissingField(i + 1))?;
        }
        let [time, dd, mm, yyyy] = fields;
        let (dd, mm, yyyy) = (dd.as_bytes(), mm.as_bytes(), yyyy.as_bytes());

        if dd.len() < 2 || !all_digits(&dd[..2]) || mm.len() < 2 || !all_digits(&mm[..2]) {
            return Err(NmeaError::BadDate);
        }
        if yyyy.len() < 4 || !all_digits(&yyyy[..4]) {
            return Err(NmeaError::BadDate);
        }

        let (hour, minute, second) = parse_hhmmss(time)?;
        let (day, month) = (two_digits(dd), two_digits(mm));
        check_month_day(month, day)?;
        let year = i32::from(two_digits(&yyyy[0..2])) * 100 + i32::from(two_digits(&yyyy[2..4]));

        let utc = CivilDateTime {
            year,
            month,
            day,
            hour,
            minute,
            second,
        };

        let mut text: String<32> = String::new();
        write!(text, "{}", utc).map_err(|_| NmeaError::BadDate)?;
        self.last_zda = text;

        debug!("ZDA {}", utc);
        Ok(())
    }
}
