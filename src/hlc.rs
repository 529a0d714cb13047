use std::{
    cmp::Ordering,
    fmt,
    io::Read,
    sync::{Arc, Mutex},
    time::{Instant, SystemTime, UNIX_EPOCH},
};

use once_cell::sync::OnceCell;

use crate::{
    error::ShoalError,
    io::{Decodeable, Encodeable},
    types::ShoalResult,
};

/// Serialized timestamp width: 8-byte physical + 8-byte logical, big-endian.
pub const HLC_WIRE_SIZE: usize = 16;

/// The process-wide wall-clock source: microseconds since the Unix epoch.
///
/// The epoch offset is captured once and extended with a monotonic reading,
/// so a concurrent NTP step cannot make two reads go backwards. This is the
/// one sanctioned process-wide singleton.
pub fn wall_clock_micros() -> u64 {
    static ANCHOR: OnceCell<(u64, Instant)> = OnceCell::new();
    let (epoch_us, started) = ANCHOR.get_or_init(|| {
        let epoch_us = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_micros() as u64)
            .unwrap_or(0);
        (epoch_us, Instant::now())
    });
    epoch_us + started.elapsed().as_micros() as u64
}

/// A hybrid logical timestamp: wall-clock microseconds plus a logical
/// counter that breaks ties within one microsecond. Ordering is
/// lexicographic, physical first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct HlcTimestamp {
    pub physical: u64,
    pub logical: u64,
}

impl HlcTimestamp {
    pub const ZERO: HlcTimestamp = HlcTimestamp {
        physical: 0,
        logical: 0,
    };

    pub fn new(physical: u64, logical: u64) -> Self {
        Self { physical, logical }
    }
}

impl fmt::Display for HlcTimestamp {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}.{}", self.physical, self.logical)
    }
}

impl Encodeable for HlcTimestamp {
    fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(HLC_WIRE_SIZE);
        buf.extend_from_slice(&self.physical.to_be_bytes());
        buf.extend_from_slice(&self.logical.to_be_bytes());
        buf
    }
}

impl Decodeable for HlcTimestamp {
    fn decode_from<R: Read>(reader: &mut R) -> ShoalResult<Self> {
        let physical = u64::decode_from(reader)?;
        let logical = u64::decode_from(reader)?;
        Ok(Self { physical, logical })
    }
}

type ClockSource = Arc<dyn Fn() -> u64 + Send + Sync>;

/// Hybrid logical clock.
///
/// Every timestamp handed out is strictly greater than every timestamp this
/// clock has handed out before, and `update` additionally moves the clock
/// past any remote timestamp it was fed. Wall-clock regression only stalls
/// the physical component; the logical counter keeps the order strict.
///
/// The state sits behind its own short mutex and never touches another
/// lock.
pub struct HybridLogicalClock {
    state: Mutex<HlcTimestamp>,
    source: ClockSource,
    /// Refuse remote timestamps running ahead of us by more than this.
    max_drift_us: Option<u64>,
}

impl HybridLogicalClock {
    pub fn new() -> Self {
        Self::with_source(Arc::new(wall_clock_micros))
    }

    pub fn with_source(source: ClockSource) -> Self {
        Self {
            state: Mutex::new(HlcTimestamp::ZERO),
            source,
            max_drift_us: None,
        }
    }

    pub fn with_max_drift(mut self, max_drift_us: u64) -> Self {
        self.max_drift_us = Some(max_drift_us);
        self
    }

    /// A fresh local timestamp. The logical counter resets whenever the
    /// wall clock has advanced past the last physical component.
    pub fn now(&self) -> HlcTimestamp {
        let mut state = self.state.lock().unwrap();
        let wall = (self.source)();
        *state = if wall > state.physical {
            HlcTimestamp::new(wall, 0)
        } else {
            HlcTimestamp::new(state.physical, state.logical + 1)
        };
        *state
    }

    /// Fold a remote timestamp into the clock. The returned timestamp is
    /// strictly greater than both the previous local state and `remote`.
    pub fn update(&self, remote: HlcTimestamp) -> ShoalResult<HlcTimestamp> {
        let mut state = self.state.lock().unwrap();
        let wall = (self.source)();

        if let Some(max_drift) = self.max_drift_us {
            if remote.physical > wall && remote.physical - wall > max_drift {
                return Err(ShoalError::Clock(format!(
                    "remote physical time {} exceeds local {} by more than {}us",
                    remote.physical, wall, max_drift
                )));
            }
        }

        *state = if wall > state.physical && wall > remote.physical {
            HlcTimestamp::new(wall, 0)
        } else if state.physical == remote.physical {
            HlcTimestamp::new(
                state.physical,
                state.logical.max(remote.logical) + 1,
            )
        } else if state.physical > remote.physical {
            HlcTimestamp::new(state.physical, state.logical + 1)
        } else {
            HlcTimestamp::new(remote.physical, remote.logical + 1)
        };
        Ok(*state)
    }

    pub fn compare(a: &HlcTimestamp, b: &HlcTimestamp) -> Ordering {
        a.cmp(b)
    }

    /// The last timestamp handed out, without advancing the clock.
    pub fn last(&self) -> HlcTimestamp {
        *self.state.lock().unwrap()
    }
}

impl Default for HybridLogicalClock {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};

    use super::*;

    fn manual_clock(start: u64) -> (Arc<AtomicU64>, HybridLogicalClock) {
        let wall = Arc::new(AtomicU64::new(start));
        let wall2 = Arc::clone(&wall);
        let clock = HybridLogicalClock::with_source(Arc::new(move || {
            wall2.load(AtomicOrdering::SeqCst)
        }));
        (wall, clock)
    }

    #[test]
    fn test_now_is_strictly_increasing() {
        let clock = HybridLogicalClock::new();
        let mut prev = clock.now();
        for _ in 0..10_000 {
            let next = clock.now();
            assert!(next > prev, "{} !> {}", next, prev);
            prev = next;
        }
    }

    #[test]
    fn test_logical_resets_when_physical_advances() {
        let (wall, clock) = manual_clock(100);
        assert_eq!(clock.now(), HlcTimestamp::new(100, 0));
        assert_eq!(clock.now(), HlcTimestamp::new(100, 1));
        wall.store(200, AtomicOrdering::SeqCst);
        assert_eq!(clock.now(), HlcTimestamp::new(200, 0));
    }

    #[test]
    fn test_wall_clock_regression_does_not_go_backwards() {
        let (wall, clock) = manual_clock(500);
        let a = clock.now();
        wall.store(100, AtomicOrdering::SeqCst); // ntp step-back
        let b = clock.now();
        let c = clock.now();
        assert!(b > a);
        assert!(c > b);
        assert_eq!(b.physical, 500);
    }

    #[test]
    fn test_update_exceeds_remote_and_local() {
        let (wall_a, a) = manual_clock(100);
        let (_wall_b, b) = manual_clock(95);

        // scenario: A emits, B folds it in, A folds B's answer back
        let ts_a = a.now();
        assert_eq!(ts_a, HlcTimestamp::new(100, 0));

        let t = b.update(ts_a).unwrap();
        assert!(t.physical >= 100);
        assert!(t > ts_a);

        wall_a.store(100, AtomicOrdering::SeqCst);
        let t2 = a.update(t).unwrap();
        assert!(t2 > t);
        assert_eq!(HybridLogicalClock::compare(&t2, &t), Ordering::Greater);
    }

    #[test]
    fn test_update_branches() {
        // wall ahead of both: reset
        let (wall, clock) = manual_clock(50);
        clock.now();
        wall.store(300, AtomicOrdering::SeqCst);
        assert_eq!(
            clock.update(HlcTimestamp::new(200, 7)).unwrap(),
            HlcTimestamp::new(300, 0)
        );

        // equal physicals: max logical + 1
        let (_, clock) = manual_clock(10);
        clock.update(HlcTimestamp::new(400, 3)).unwrap();
        assert_eq!(
            clock.update(HlcTimestamp::new(400, 9)).unwrap(),
            HlcTimestamp::new(400, 10)
        );

        // local ahead: bump local logical
        let (_, clock) = manual_clock(10);
        clock.update(HlcTimestamp::new(400, 3)).unwrap();
        assert_eq!(
            clock.update(HlcTimestamp::new(300, 50)).unwrap(),
            HlcTimestamp::new(400, 5)
        );
    }

    #[test]
    fn test_interleaved_now_update_monotonic() {
        let (wall, clock) = manual_clock(1000);
        let mut prev = HlcTimestamp::ZERO;
        for i in 0..1000u64 {
            let ts = if i % 3 == 0 {
                clock.update(HlcTimestamp::new(900 + i, i)).unwrap()
            } else {
                clock.now()
            };
            assert!(ts > prev);
            prev = ts;
            if i % 7 == 0 {
                // wall clock wobbles, sometimes backwards
                wall.store(1000 + (i % 11) * 3, AtomicOrdering::SeqCst);
            }
        }
    }

    #[test]
    fn test_drift_guard() {
        let (_, clock) = manual_clock(1000);
        let clock = clock.with_max_drift(500);
        let err = clock.update(HlcTimestamp::new(10_000, 0)).unwrap_err();
        assert!(matches!(err, ShoalError::Clock(_)));
        // within the window is fine
        clock.update(HlcTimestamp::new(1400, 0)).unwrap();
    }

    #[test]
    fn test_wire_format() {
        let ts = HlcTimestamp::new(0x0102030405060708, 0x1112131415161718);
        let bytes = ts.encode();
        assert_eq!(bytes.len(), HLC_WIRE_SIZE);
        assert_eq!(bytes[0], 0x01);
        assert_eq!(bytes[7], 0x08);
        assert_eq!(bytes[8], 0x11);

        let decoded =
            HlcTimestamp::decode_from(&mut std::io::Cursor::new(bytes)).unwrap();
        assert_eq!(decoded, ts);
    }
}
