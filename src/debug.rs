//! Real-time diagnostics for the processing thread.
//!
//! With the `debug` feature, `vx_log!` formats into a stack buffer and pushes
//! the bytes as one length-prefixed record onto a byte ring, never
//! allocating. The controller drains the ring into the `log` facade once the
//! processing thread has exited. Without the feature the macro compiles to
//! nothing.

use std::fmt;

#[cfg(feature = "debug")]
mod ring {
    use ringbuf::{Consumer, Producer, RingBuffer};
    use std::fmt;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Mutex, OnceLock};

    /// Longest message kept; the rest is cut off.
    pub const MSG_MAX: usize = 256;
    const RING_BYTES: usize = 16 * 1024;
    const LEN_PREFIX: usize = 2;

    /// Byte ring of `len u16 LE | bytes` records. Records are written whole
    /// or not at all.
    pub struct LogRing {
        prod: Mutex<Producer<u8>>,
        cons: Mutex<Consumer<u8>>,
        dropped: AtomicUsize,
    }

    impl LogRing {
        pub fn new(capacity: usize) -> Self {
            let (prod, cons) = RingBuffer::<u8>::new(capacity).split();
            Self {
                prod: Mutex::new(prod),
                cons: Mutex::new(cons),
                dropped: AtomicUsize::new(0),
            }
        }

        /// Queue one message. Drops it when the ring is full or the drain
        /// side holds the producer.
        pub fn push(&self, msg: &[u8]) -> bool {
            let msg = &msg[..msg.len().min(MSG_MAX)];
            let Ok(mut prod) = self.prod.try_lock() else {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                return false;
            };
            if prod.remaining() < LEN_PREFIX + msg.len() {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                return false;
            }
            prod.push_slice(&(msg.len() as u16).to_le_bytes());
            prod.push_slice(msg);
            true
        }

        /// Pop the oldest record into `out`, returning its length.
        pub fn pop_into(&self, out: &mut [u8; MSG_MAX]) -> Option<usize> {
            let mut cons = self.cons.lock().ok()?;
            if cons.len() < LEN_PREFIX {
                return None;
            }
            let mut prefix = [0u8; LEN_PREFIX];
            cons.pop_slice(&mut prefix);
            let len = (u16::from_le_bytes(prefix) as usize).min(MSG_MAX);
            Some(cons.pop_slice(&mut out[..len]))
        }

        pub fn take_dropped(&self) -> usize {
            self.dropped.swap(0, Ordering::Relaxed)
        }
    }

    struct StackBuf {
        bytes: [u8; MSG_MAX],
        len: usize,
    }

    impl fmt::Write for StackBuf {
        fn write_str(&mut self, s: &str) -> fmt::Result {
            let n = s.len().min(MSG_MAX - self.len);
            self.bytes[self.len..self.len + n].copy_from_slice(&s.as_bytes()[..n]);
            self.len += n;
            Ok(())
        }
    }

    static RING: OnceLock<LogRing> = OnceLock::new();

    pub fn init() {
        RING.get_or_init(|| LogRing::new(RING_BYTES));
    }

    pub fn push_args(ring: &LogRing, args: fmt::Arguments) -> bool {
        let mut buf = StackBuf {
            bytes: [0; MSG_MAX],
            len: 0,
        };
        let _ = fmt::write(&mut buf, args);
        ring.push(&buf.bytes[..buf.len])
    }

    pub fn log_args(args: fmt::Arguments) {
        if let Some(ring) = RING.get() {
            push_args(ring, args);
        }
    }

    pub fn drain_ring(ring: &LogRing) -> usize {
        let mut out = [0u8; MSG_MAX];
        let mut drained = 0;
        while let Some(len) = ring.pop_into(&mut out) {
            log::debug!(target: "vxhear::rt", "{}", String::from_utf8_lossy(&out[..len]));
            drained += 1;
        }
        let dropped = ring.take_dropped();
        if dropped > 0 {
            log::warn!(target: "vxhear::rt", "{} real-time log entries dropped", dropped);
        }
        drained
    }

    pub fn drain() -> usize {
        RING.get().map_or(0, drain_ring)
    }
}

#[doc(hidden)]
#[cfg(feature = "debug")]
pub fn vx_log_inner(args: fmt::Arguments) {
    ring::log_args(args);
}

#[doc(hidden)]
#[cfg(not(feature = "debug"))]
pub fn vx_log_inner(_args: fmt::Arguments) {}

#[macro_export]
macro_rules! vx_log {
    ($($arg:tt)*) => {
        $crate::debug::vx_log_inner(format_args!($($arg)*))
    };
}

/// Enable the real-time log ring. No-op without the `debug` feature.
pub fn init() {
    #[cfg(feature = "debug")]
    ring::init();
}

/// Drain queued real-time entries into the `log` facade.
pub fn drain() -> usize {
    #[cfg(feature = "debug")]
    {
        ring::drain()
    }
    #[cfg(not(feature = "debug"))]
    {
        0
    }
}

#[cfg(all(test, feature = "debug"))]
mod tests {
    use super::ring::{drain_ring, push_args, LogRing, MSG_MAX};

    fn pop_string(ring: &LogRing) -> Option<String> {
        let mut out = [0u8; MSG_MAX];
        let len = ring.pop_into(&mut out)?;
        Some(String::from_utf8_lossy(&out[..len]).into_owned())
    }

    #[test]
    fn test_records_come_back_in_order() {
        let ring = LogRing::new(1024);
        assert!(push_args(&ring, format_args!("read failed ({})", 3)));
        assert!(push_args(&ring, format_args!("")));
        assert!(push_args(&ring, format_args!("panic")));
        assert_eq!(pop_string(&ring).as_deref(), Some("read failed (3)"));
        assert_eq!(pop_string(&ring).as_deref(), Some(""));
        assert_eq!(pop_string(&ring).as_deref(), Some("panic"));
        assert_eq!(pop_string(&ring), None);
    }

    #[test]
    fn test_full_ring_drops_whole_records() {
        // room for one 10-byte record plus prefix, not two
        let ring = LogRing::new(20);
        assert!(ring.push(b"0123456789"));
        assert!(!ring.push(b"abcdefghij"));
        assert_eq!(pop_string(&ring).as_deref(), Some("0123456789"));
        assert_eq!(pop_string(&ring), None);
        assert_eq!(ring.take_dropped(), 1);
        assert_eq!(ring.take_dropped(), 0);
    }

    #[test]
    fn test_long_message_is_truncated() {
        let ring = LogRing::new(4096);
        let long = "x".repeat(MSG_MAX * 2);
        assert!(push_args(&ring, format_args!("{long}")));
        assert_eq!(pop_string(&ring).map(|s| s.len()), Some(MSG_MAX));
        assert_eq!(drain_ring(&ring), 0);
    }
}
