/*!
Découpage en lignes du flux série GPS

Le thread série (équivalent de l'interruption UART RX) pousse les octets
dans un tampon circulaire SPSC sans verrou ; la boucle principale en extrait
des trames NMEA complètes.

Discipline des index :
- seul le producteur avance `head`, seul le consommateur avance `tail`
- la taille est une puissance de deux (vérifiée à la compilation)
- un débordement ne bloque jamais : l'octet est perdu et compté, puis le
  producteur ignore tout jusqu'au prochain '$'. La trame coupée reste dans le
  tampon suivie directement d'un '$', et le consommateur la rejette comme une
  trame interrompue.
*/

use std::sync::atomic::{AtomicU32, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

/// Taille du tampon circulaire UART
pub const RING_SIZE: usize = 2048;

/// Longueur maximale d'une trame NMEA acceptée (NMEA limite à 82 octets)
pub const LINE_CAPACITY: usize = 256;

/// Tampon circulaire partagé entre le producteur et le consommateur
///
/// Les cases sont accédées en `Relaxed` : c'est le couple Release/Acquire sur
/// `head` et `tail` qui publie leur contenu d'un côté à l'autre.
pub struct RingBuffer<const N: usize> {
    buf: [AtomicU8; N],
    head: AtomicUsize,
    tail: AtomicUsize,
    overflow_count: AtomicU32,
}

impl<const N: usize> RingBuffer<N> {
    const MASK: usize = {
        assert!(N.is_power_of_two(), "ring size must be a power of two");
        N - 1
    };

    /// Crée le tampon et retourne ses deux extrémités
    pub fn split() -> (Producer<N>, Consumer<N>) {
        let ring = Arc::new(RingBuffer {
            buf: std::array::from_fn(|_| AtomicU8::new(0)),
            head: AtomicUsize::new(0),
            tail: AtomicUsize::new(0),
            overflow_count: AtomicU32::new(0),
        });

        (
            Producer {
                ring: Arc::clone(&ring),
                resyncing: false,
            },
            Consumer { ring },
        )
    }

    #[inline]
    fn next(index: usize) -> usize {
        (index + 1) & Self::MASK
    }
}

/// Extrémité écriture (contexte interruption / thread série)
pub struct Producer<const N: usize> {
    ring: Arc<RingBuffer<N>>,
    /// Trame coupée par un débordement : on attend le prochain '$'
    resyncing: bool,
}

impl<const N: usize> Producer<N> {
    /// Ajoute un octet. Retourne false si l'octet est perdu : tampon plein,
    /// ou reste d'une trame coupée par un débordement.
    pub fn push_byte(&mut self, byte: u8) -> bool {
        if self.resyncing && byte != b'$' {
            return false;
        }

        let ring = &*self.ring;
        let head = ring.head.load(Ordering::Relaxed);
        let next = RingBuffer::<N>::next(head);

        if next == ring.tail.load(Ordering::Acquire) {
            ring.overflow_count.fetch_add(1, Ordering::Relaxed);
            self.resyncing = true;
            return false;
        }

        ring.buf[head].store(byte, Ordering::Relaxed);
        ring.head.store(next, Ordering::Release);
        self.resyncing = false;
        true
    }

    /// Ajoute une série d'octets, retourne le nombre d'octets stockés
    pub fn push_slice(&mut self, bytes: &[u8]) -> usize {
        let mut stored = 0;
        for &b in bytes {
            if self.push_byte(b) {
                stored += 1;
            }
        }
        stored
    }

    pub fn overflow_count(&self) -> u32 {
        self.ring.overflow_count.load(Ordering::Relaxed)
    }
}

/// Extrémité lecture (boucle principale)
pub struct Consumer<const N: usize> {
    ring: Arc<RingBuffer<N>>,
}

impl<const N: usize> Consumer<N> {
    fn head(&self) -> usize {
        self.ring.head.load(Ordering::Acquire)
    }

    fn tail(&self) -> usize {
        self.ring.tail.load(Ordering::Relaxed)
    }

    fn byte_at(&self, index: usize) -> u8 {
        self.ring.buf[index].load(Ordering::Relaxed)
    }

    /// Libère toutes les cases jusqu'à `tail` (exclu)
    fn commit(&mut self, tail: usize) {
        self.ring.tail.store(tail, Ordering::Release);
    }

    fn used(head: usize, tail: usize) -> usize {
        head.wrapping_sub(tail) & RingBuffer::<N>::MASK
    }

    pub fn overflow_count(&self) -> u32 {
        self.ring.overflow_count.load(Ordering::Relaxed)
    }
}

/// Résultat du balayage d'une trame
enum Scan {
    /// Fin de ligne trouvée, index juste après le '\n'
    Complete(usize),
    /// Un nouveau '$' commence avant la fin de ligne
    Restart(usize),
    /// Pas encore de fin de ligne
    Incomplete,
}

/// Extracteur de lignes NMEA côté boucle principale
pub struct LineFramer<const N: usize> {
    consumer: Consumer<N>,
    discarding: bool,
    last_overflow_seen: u32,
    truncated_count: u32,
}

impl<const N: usize> LineFramer<N> {
    pub fn new(consumer: Consumer<N>) -> Self {
        let last_overflow_seen = consumer.overflow_count();
        LineFramer {
            consumer,
            discarding: false,
            last_overflow_seen,
            truncated_count: 0,
        }
    }

    /// Extrait la prochaine trame complète (sans CR/LF) dans `out`
    ///
    /// Une trame incomplète n'est pas consommée. Une trame plus longue que
    /// `out` est jetée jusqu'à sa fin de ligne et n'est jamais retournée.
    pub fn try_read_line<'a>(&mut self, out: &'a mut [u8]) -> Option<&'a [u8]> {
        let len = self.read_into(out)?;
        Some(&out[..len])
    }

    /// Nombre de trames jetées car trop longues
    pub fn truncated_count(&self) -> u32 {
        self.truncated_count
    }

    /// Nombre de débordements du tampon
    pub fn overflow_count(&self) -> u32 {
        self.consumer.overflow_count()
    }

    fn read_into(&mut self, out: &mut [u8]) -> Option<usize> {
        let overflow = self.consumer.overflow_count();
        if overflow != self.last_overflow_seen {
            warn!(
                "GPS ring buffer overflow ({} so far), cut sentence dropped at next '$'",
                overflow
            );
            self.last_overflow_seen = overflow;
        }

        // Une seule lecture de head par appel
        let head = self.consumer.head();
        let mut tail = self.consumer.tail();

        loop {
            if self.discarding {
                while tail != head {
                    let c = self.consumer.byte_at(tail);
                    if c == b'$' {
                        self.discarding = false;
                        break;
                    }
                    tail = RingBuffer::<N>::next(tail);
                    if c == b'\n' {
                        self.discarding = false;
                        break;
                    }
                }
                self.consumer.commit(tail);
                if self.discarding {
                    return None;
                }
            }

            // Bruit avant le début de trame
            while tail != head && self.consumer.byte_at(tail) != b'$' {
                tail = RingBuffer::<N>::next(tail);
            }
            self.consumer.commit(tail);
            if tail == head {
                return None;
            }

            let (scan, len, oversized) = self.scan_sentence(tail, head, out);
            match scan {
                Scan::Complete(end) => {
                    self.consumer.commit(end);
                    tail = end;
                    if oversized {
                        self.truncated_count = self.truncated_count.wrapping_add(1);
                        debug!("Dropped oversized NMEA sentence");
                        continue;
                    }
                    return Some(len);
                }
                Scan::Restart(at) => {
                    self.consumer.commit(at);
                    tail = at;
                    debug!("Dropped unterminated NMEA sentence");
                }
                Scan::Incomplete => {
                    let ring_full = Consumer::<N>::used(head, tail) == N - 1;
                    if oversized || ring_full {
                        // Ne pourra jamais tenir : on jette jusqu'à la fin de ligne
                        self.consumer.commit(head);
                        self.discarding = true;
                        self.truncated_count = self.truncated_count.wrapping_add(1);
                        debug!("Discarding oversized NMEA sentence");
                    }
                    return None;
                }
            }
        }
    }

    /// Balaye une trame commençant par '$' à `start`, sans rien consommer
    fn scan_sentence(&self, start: usize, head: usize, out: &mut [u8]) -> (Scan, usize, bool) {
        let mut cursor = start;
        let mut len = 0usize;
        let mut oversized = false;

        loop {
            if cursor == head {
                return (Scan::Incomplete, len, oversized);
            }

            let c = self.consumer.byte_at(cursor);
            if c == b'$' && cursor != start {
                return (Scan::Restart(cursor), len, oversized);
            }
            cursor = RingBuffer::<N>::next(cursor);

            match c {
                b'\r' => {}
                b'\n' => return (Scan::Complete(cursor), len, oversized),
                _ => {
                    if len < out.len() {
                        out[len] = c;
                        len += 1;
                    } else {
                        oversized = true;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const RMC: &[u8] = b"$GPRMC,123519,A,4807.038,N,01131.000,E,022.4,084.4,230394,003.1,W*6A";

    fn framer<const N: usize>() -> (Producer<N>, LineFramer<N>) {
        let (producer, consumer) = RingBuffer::<N>::split();
        (producer, LineFramer::new(consumer))
    }

    #[test]
    fn test_reads_complete_line_without_crlf() {
        let (mut producer, mut framer) = framer::<256>();
        producer.push_slice(RMC);
        producer.push_slice(b"\r\n");

        let mut line = [0u8; LINE_CAPACITY];
        assert_eq!(framer.try_read_line(&mut line), Some(RMC));
        assert_eq!(framer.try_read_line(&mut line), None);
    }

    #[test]
    fn test_incomplete_line_is_not_consumed() {
        let (mut producer, mut framer) = framer::<256>();
        let mut line = [0u8; LINE_CAPACITY];

        producer.push_slice(b"$GPGGA,123519,4807");
        assert_eq!(framer.try_read_line(&mut line), None);

        producer.push_slice(b".038,N\r\n");
        assert_eq!(
            framer.try_read_line(&mut line),
            Some(&b"$GPGGA,123519,4807.038,N"[..])
        );
    }

    #[test]
    fn test_skips_noise_before_dollar() {
        let (mut producer, mut framer) = framer::<256>();
        producer.push_slice(b"garbage\r\n\x00\x7f$GPZDA,1\r\n");

        let mut line = [0u8; LINE_CAPACITY];
        assert_eq!(framer.try_read_line(&mut line), Some(&b"$GPZDA,1"[..]));
    }

    #[test]
    fn test_multiple_lines_in_order() {
        let (mut producer, mut framer) = framer::<256>();
        producer.push_slice(b"$A,1\r\n$B,2\r\n$C,3\n");

        let mut line = [0u8; 32];
        assert_eq!(framer.try_read_line(&mut line), Some(&b"$A,1"[..]));
        assert_eq!(framer.try_read_line(&mut line), Some(&b"$B,2"[..]));
        assert_eq!(framer.try_read_line(&mut line), Some(&b"$C,3"[..]));
        assert_eq!(framer.try_read_line(&mut line), None);
    }

    #[test]
    fn test_oversized_sentence_is_dropped_but_framing_kept() {
        let (mut producer, mut framer) = framer::<256>();
        producer.push_slice(b"$GPGSV,this-sentence-is-way-too-long-for-the-buffer\r\n$GPZDA,ok\r\n");

        let mut line = [0u8; 16];
        assert_eq!(framer.try_read_line(&mut line), Some(&b"$GPZDA,ok"[..]));
        assert_eq!(framer.truncated_count(), 1);
    }

    #[test]
    fn test_oversized_sentence_spanning_calls() {
        let (mut producer, mut framer) = framer::<256>();
        let mut line = [0u8; 8];

        producer.push_slice(b"$GPGSV,0123456789");
        assert_eq!(framer.try_read_line(&mut line), None);

        producer.push_slice(b"abcdef\r\n$A,1\r\n");
        assert_eq!(framer.try_read_line(&mut line), Some(&b"$A,1"[..]));
        assert_eq!(framer.truncated_count(), 1);
    }

    #[test]
    fn test_overflow_then_fresh_sentence() {
        let (mut producer, mut framer) = framer::<64>();
        let mut line = [0u8; 128];

        // Remplir au-delà de la capacité sans fin de ligne
        for _ in 0..100 {
            producer.push_byte(b'x');
        }
        assert!(producer.overflow_count() > 0);
        assert_eq!(framer.try_read_line(&mut line), None);

        producer.push_slice(b"$GPZDA,123519,23,03,1994,00,00*5D\r\n");
        assert_eq!(
            framer.try_read_line(&mut line),
            Some(&b"$GPZDA,123519,23,03,1994,00,00*5D"[..])
        );
    }

    #[test]
    fn test_overflow_inside_sentence_does_not_splice() {
        let (mut producer, mut framer) = framer::<32>();
        let mut line = [0u8; 128];

        // Trame coupée par le débordement : sa fin est perdue
        producer.push_slice(b"$GPGGA,123519,4807.038,N,01131.000,E");
        assert!(producer.overflow_count() > 0);
        assert_eq!(framer.try_read_line(&mut line), None);

        producer.push_slice(b",1,08\r\n$GPRMC,1\r\n");
        assert_eq!(framer.try_read_line(&mut line), Some(&b"$GPRMC,1"[..]));
        assert_eq!(framer.try_read_line(&mut line), None);
    }

    #[test]
    fn test_overflow_keeps_complete_lines_and_drops_cut_sentence() {
        const ZDA: &[u8] = b"$GPZDA,123519,23,03,1994,00,00*5D";
        let (mut producer, mut framer) = framer::<64>();
        let mut line = [0u8; 128];

        // 35 octets de ZDA, puis une GGA dont seuls 28 octets tiennent
        assert_eq!(producer.push_slice(ZDA), 33);
        assert_eq!(producer.push_slice(b"\r\n"), 2);
        assert_eq!(producer.push_slice(b"$GPGGA,123519,4807.038,N,01131.000,E,1,08"), 28);
        assert_eq!(producer.overflow_count(), 1);

        assert_eq!(framer.try_read_line(&mut line), Some(ZDA));
        assert_eq!(framer.try_read_line(&mut line), None);

        // La fin de la GGA arrive une fois la place libérée
        assert_eq!(producer.push_slice(b",0.9*47\r\n"), 0);
        assert_eq!(framer.try_read_line(&mut line), None);

        assert_eq!(producer.push_slice(b"$GPRMC,1\r\n"), 10);
        assert_eq!(framer.try_read_line(&mut line), Some(&b"$GPRMC,1"[..]));
        assert_eq!(framer.try_read_line(&mut line), None);
        assert_eq!(producer.overflow_count(), 1);
    }

    #[test]
    fn test_concurrent_producer_and_consumer() {
        const LINES: u32 = 20_000;
        let (mut producer, mut framer) = framer::<64>();
        let done = Arc::new(std::sync::atomic::AtomicBool::new(false));

        let writer = {
            let done = Arc::clone(&done);
            std::thread::spawn(move || {
                for k in 0..LINES {
                    producer.push_slice(format!("$N,{}\r\n", k).as_bytes());
                    if k % 4 == 0 {
                        std::thread::yield_now();
                    }
                }
                done.store(true, Ordering::Release);
                producer
            })
        };

        let mut line = [0u8; 32];
        let mut last: Option<u32> = None;
        let mut received = 0u32;
        loop {
            let finished = done.load(Ordering::Acquire);
            match framer.try_read_line(&mut line) {
                Some(bytes) => {
                    let text = std::str::from_utf8(bytes).unwrap();
                    let k: u32 = text
                        .strip_prefix("$N,")
                        .and_then(|n| n.parse().ok())
                        .unwrap_or_else(|| panic!("malformed line {:?}", text));
                    if let Some(prev) = last {
                        assert!(k > prev, "line {} after {}", k, prev);
                    }
                    last = Some(k);
                    received += 1;
                }
                None if finished => break,
                None => std::thread::yield_now(),
            }
        }

        let producer = writer.join().unwrap();
        assert!(received > 0);
        assert!(last.unwrap() < LINES);
        if producer.overflow_count() == 0 {
            assert_eq!(received, LINES);
            assert_eq!(last, Some(LINES - 1));
        }
    }

    #[test]
    fn test_dollar_restarts_framing() {
        let (mut producer, mut framer) = framer::<256>();
        producer.push_slice(b"$GPGGA,12$GPRMC,2\r\n");

        let mut line = [0u8; 64];
        assert_eq!(framer.try_read_line(&mut line), Some(&b"$GPRMC,2"[..]));
    }

    #[test]
    fn test_wraps_around_ring() {
        let (mut producer, mut framer) = framer::<16>();
        let mut line = [0u8; 16];

        for _ in 0..10 {
            assert_eq!(producer.push_slice(b"$AB,12\r\n"), 8);
            assert_eq!(framer.try_read_line(&mut line), Some(&b"$AB,12"[..]));
        }
        assert_eq!(framer.overflow_count(), 0);
    }
}
