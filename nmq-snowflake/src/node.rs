//! Snowflake generator.
//!
//! An id packs three fields, most significant first:
//!
//! ```text
//! +---+--------------------------+-------------+----------------+
//! | 0 | timestamp (ms, epoch)    | node        | sequence       |
//! | 1 | 63 - node - step bits    | node_bits   | step_bits      |
//! +---+--------------------------+-------------+----------------+
//! ```
//!
//! The layout is fixed when the generator is built. Two generators with
//! different layouts never share state.

use crate::clock::{Clock, MonotonicClock};
use crate::error::SnowflakeError;
use crate::id::SnowId;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

/// Twitter snowflake epoch, Nov 04 2010 01:42:54 UTC, in milliseconds.
pub const DEFAULT_EPOCH_MS: i64 = 1_288_834_974_657;

/// Default width of the node field.
pub const DEFAULT_NODE_BITS: u8 = 10;

/// Default width of the sequence field.
pub const DEFAULT_STEP_BITS: u8 = 12;

/// Node and sequence share these bits; the timestamp keeps the other 41.
pub const MAX_NODE_STEP_BITS: u8 = 22;

/// Total usable bits in an id (the sign bit stays clear).
const ID_BITS: u8 = 63;

/// Default regression the generator waits out before failing.
pub const DEFAULT_MAX_BACKWARD_MS: i64 = 5;

/// Default bound on a single busy-wait for the clock.
pub const DEFAULT_SPIN_LIMIT: Duration = Duration::from_secs(1);

/// Widths of the node and sequence fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BitLayout {
    node_bits: u8,
    step_bits: u8,
}

impl BitLayout {
    pub fn new(node_bits: u8, step_bits: u8) -> Result<Self, SnowflakeError> {
        if node_bits as u16 + step_bits as u16 > MAX_NODE_STEP_BITS as u16 {
            return Err(SnowflakeError::InvalidBitLayout {
                node_bits,
                step_bits,
                max: MAX_NODE_STEP_BITS,
            });
        }
        Ok(Self {
            node_bits,
            step_bits,
        })
    }

    pub fn node_bits(&self) -> u8 {
        self.node_bits
    }

    pub fn step_bits(&self) -> u8 {
        self.step_bits
    }

    /// Largest valid node number.
    pub fn node_max(&self) -> i64 {
        -1 ^ (-1 << self.node_bits)
    }

    pub fn node_mask(&self) -> i64 {
        self.node_max() << self.step_bits
    }

    pub fn step_mask(&self) -> i64 {
        -1 ^ (-1 << self.step_bits)
    }

    pub fn time_shift(&self) -> u8 {
        self.node_bits + self.step_bits
    }

    pub fn node_shift(&self) -> u8 {
        self.step_bits
    }

    /// Width of the timestamp field.
    pub fn time_bits(&self) -> u8 {
        ID_BITS - self.time_shift()
    }
}

impl Default for BitLayout {
    fn default() -> Self {
        Self {
            node_bits: DEFAULT_NODE_BITS,
            step_bits: DEFAULT_STEP_BITS,
        }
    }
}

/// Generator settings.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Epoch in Unix milliseconds.
    pub epoch_ms: i64,
    pub layout: BitLayout,
    /// Clock regression (ms) that is waited out instead of failing.
    pub max_backward_ms: i64,
    /// Bound on one busy-wait for the clock to advance.
    pub spin_limit: Duration,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            epoch_ms: DEFAULT_EPOCH_MS,
            layout: BitLayout::default(),
            max_backward_ms: DEFAULT_MAX_BACKWARD_MS,
            spin_limit: DEFAULT_SPIN_LIMIT,
        }
    }
}

impl Settings {
    pub fn with_epoch_ms(mut self, epoch_ms: i64) -> Self {
        self.epoch_ms = epoch_ms;
        self
    }

    pub fn with_layout(mut self, layout: BitLayout) -> Self {
        self.layout = layout;
        self
    }

    pub fn with_max_backward_ms(mut self, ms: i64) -> Self {
        self.max_backward_ms = ms;
        self
    }

    pub fn with_spin_limit(mut self, limit: Duration) -> Self {
        self.spin_limit = limit;
        self
    }
}

/// Fields recovered from an id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdParts {
    /// Unix milliseconds.
    pub timestamp_ms: i64,
    pub node: i64,
    pub sequence: i64,
}

impl IdParts {
    pub fn time(&self) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp_millis(self.timestamp_ms)
    }
}

#[derive(Debug)]
struct State {
    /// Last timestamp handed out, relative to the epoch.
    last: i64,
    step: i64,
}

/// A snowflake generator for one node.
pub struct SnowNode {
    node: i64,
    epoch_ms: i64,
    layout: BitLayout,
    max_backward_ms: i64,
    spin_limit: Duration,
    clock: Box<dyn Clock>,
    state: Mutex<State>,
    halted: AtomicBool,
}

impl std::fmt::Debug for SnowNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SnowNode")
            .field("node", &self.node)
            .field("epoch_ms", &self.epoch_ms)
            .field("layout", &self.layout)
            .field("halted", &self.is_halted())
            .finish()
    }
}

impl SnowNode {
    /// Creates a generator with the default epoch and layout.
    pub fn new(node: i64) -> Result<Self, SnowflakeError> {
        Self::with_settings(node, Settings::default())
    }

    pub fn with_settings(node: i64, settings: Settings) -> Result<Self, SnowflakeError> {
        Self::with_clock(node, settings, MonotonicClock::new())
    }

    /// Creates a generator reading time from `clock`.
    pub fn with_clock(
        node: i64,
        settings: Settings,
        clock: impl Clock + 'static,
    ) -> Result<Self, SnowflakeError> {
        let layout = settings.layout;
        if node < 0 || node > layout.node_max() {
            return Err(SnowflakeError::NodeOutOfRange {
                node,
                max: layout.node_max(),
            });
        }

        let now_ms = clock.now_millis();
        if now_ms < settings.epoch_ms {
            return Err(SnowflakeError::EpochInFuture {
                epoch_ms: settings.epoch_ms,
                now_ms,
            });
        }

        tracing::debug!(
            "Snowflake node {} ready (node_bits={}, step_bits={}, epoch={})",
            node,
            layout.node_bits(),
            layout.step_bits(),
            settings.epoch_ms
        );

        Ok(Self {
            node,
            epoch_ms: settings.epoch_ms,
            layout,
            max_backward_ms: settings.max_backward_ms,
            spin_limit: settings.spin_limit,
            clock: Box::new(clock),
            state: Mutex::new(State { last: -1, step: 0 }),
            halted: AtomicBool::new(false),
        })
    }

    /// Mints the next id.
    ///
    /// Ids from one node are strictly increasing. When the sequence is
    /// exhausted within a millisecond the call busy-waits for the next one.
    pub fn generate(&self) -> Result<SnowId, SnowflakeError> {
        if self.is_halted() {
            return Err(SnowflakeError::Halted);
        }

        let mut state = self.state.lock();
        let mut now = self.elapsed();

        if now < state.last {
            let behind = state.last - now;
            if behind > self.max_backward_ms {
                tracing::warn!(
                    "Clock moved backwards by {} ms on node {}, refusing to generate",
                    behind,
                    self.node
                );
                return Err(SnowflakeError::ClockMovedBackwards {
                    last: state.last,
                    now,
                });
            }
            now = self.wait_until(state.last)?;
        }

        // Nothing is written back until the id is certain, so a failed wait
        // leaves the sequence exhausted for the next caller.
        let step = if now == state.last {
            let step = (state.step + 1) & self.layout.step_mask();
            if step == 0 {
                now = self.wait_until(state.last + 1)?;
            }
            step
        } else {
            0
        };

        if now >> self.layout.time_bits() != 0 {
            return Err(SnowflakeError::TimestampOverflow {
                elapsed_ms: now,
                bits: self.layout.time_bits(),
            });
        }

        state.last = now;
        state.step = step;

        Ok(SnowId::new(
            (now << self.layout.time_shift()) | (self.node << self.layout.node_shift()) | step,
        ))
    }

    /// Spins until the clock reaches `target`.
    fn wait_until(&self, target: i64) -> Result<i64, SnowflakeError> {
        let started = Instant::now();
        loop {
            let now = self.elapsed();
            if now >= target {
                return Ok(now);
            }
            if self.is_halted() {
                return Err(SnowflakeError::Halted);
            }
            let waited = started.elapsed();
            if waited > self.spin_limit {
                return Err(SnowflakeError::ClockStalled {
                    waited_ms: waited.as_millis() as u64,
                });
            }
            std::hint::spin_loop();
        }
    }

    /// Milliseconds since the epoch.
    fn elapsed(&self) -> i64 {
        self.clock.now_millis() - self.epoch_ms
    }

    /// Stops the generator; pending and future calls fail with `Halted`.
    pub fn halt(&self) {
        self.halted.store(true, Ordering::Release);
    }

    pub fn is_halted(&self) -> bool {
        self.halted.load(Ordering::Acquire)
    }

    /// Splits an id using this node's layout and epoch.
    pub fn decompose(&self, id: SnowId) -> IdParts {
        let raw = id.as_i64();
        IdParts {
            timestamp_ms: (raw >> self.layout.time_shift()) + self.epoch_ms,
            node: (raw & self.layout.node_mask()) >> self.layout.node_shift(),
            sequence: raw & self.layout.step_mask(),
        }
    }

    pub fn node(&self) -> i64 {
        self.node
    }

    pub fn epoch_ms(&self) -> i64 {
        self.epoch_ms
    }

    pub fn layout(&self) -> BitLayout {
        self.layout
    }
}

/// Derives a node number from a component name.
///
/// The name is hashed with 64-bit FNV-1 and folded into the node range, so the
/// same name always maps to the same node.
pub fn node_id_from_name(name: &str, layout: BitLayout) -> i64 {
    const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
    const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

    let hash = name.bytes().fold(FNV_OFFSET, |hash, b| {
        hash.wrapping_mul(FNV_PRIME) ^ b as u64
    });
    (hash % (layout.node_max() as u64 + 1)) as i64
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::atomic::AtomicI64;
    use std::sync::Arc;

    const T0: i64 = DEFAULT_EPOCH_MS + 1_000_000;

    #[derive(Debug, Default)]
    struct ManualClock(AtomicI64);

    impl ManualClock {
        fn at(ms: i64) -> Arc<Self> {
            Arc::new(Self(AtomicI64::new(ms)))
        }

        fn set(&self, ms: i64) {
            self.0.store(ms, Ordering::SeqCst);
        }
    }

    impl Clock for ManualClock {
        fn now_millis(&self) -> i64 {
            self.0.load(Ordering::SeqCst)
        }
    }

    fn fast_settings() -> Settings {
        Settings::default().with_spin_limit(Duration::from_millis(20))
    }

    #[test]
    fn test_node_range() {
        assert!(SnowNode::new(0).is_ok());
        assert!(SnowNode::new(1023).is_ok());
        assert_eq!(
            SnowNode::new(1024).unwrap_err(),
            SnowflakeError::NodeOutOfRange {
                node: 1024,
                max: 1023
            }
        );
        assert!(SnowNode::new(-1).is_err());
    }

    #[test]
    fn test_bit_layout() {
        let layout = BitLayout::default();
        assert_eq!(layout.node_max(), 1023);
        assert_eq!(layout.step_mask(), 4095);
        assert_eq!(layout.time_shift(), 22);
        assert_eq!(layout.time_bits(), 41);

        assert!(BitLayout::new(12, 10).is_ok());
        assert!(matches!(
            BitLayout::new(12, 11),
            Err(SnowflakeError::InvalidBitLayout { .. })
        ));
    }

    #[test]
    fn test_epoch_in_future() {
        let clock = ManualClock::at(DEFAULT_EPOCH_MS - 1);
        let result = SnowNode::with_clock(1, Settings::default(), clock);
        assert!(matches!(result, Err(SnowflakeError::EpochInFuture { .. })));
    }

    #[test]
    fn test_id_composition() {
        let clock = ManualClock::at(T0);
        let node = SnowNode::with_clock(5, Settings::default(), clock.clone()).unwrap();

        let first = node.generate().unwrap();
        assert_eq!(first.as_i64(), (1_000_000 << 22) | (5 << 12));

        let second = node.generate().unwrap();
        assert_eq!(second.as_i64(), first.as_i64() + 1);

        clock.set(T0 + 1);
        let third = node.generate().unwrap();
        assert_eq!(node.decompose(third).sequence, 0);
        assert_eq!(node.decompose(third).timestamp_ms, T0 + 1);
    }

    #[test]
    fn test_sequential_ids_strictly_increase() {
        let node = SnowNode::new(1).unwrap();
        let mut last = node.generate().unwrap();
        for _ in 0..20_000 {
            let next = node.generate().unwrap();
            assert!(next > last);
            last = next;
        }
    }

    #[test]
    fn test_concurrent_ids_unique() {
        let node = Arc::new(SnowNode::new(7).unwrap());
        let threads: Vec<_> = (0..8)
            .map(|_| {
                let node = node.clone();
                std::thread::spawn(move || {
                    (0..5_000)
                        .map(|_| node.generate().unwrap())
                        .collect::<Vec<_>>()
                })
            })
            .collect();

        let mut seen = HashSet::new();
        for t in threads {
            for id in t.join().unwrap() {
                assert!(seen.insert(id), "duplicate id {}", id);
            }
        }
        assert_eq!(seen.len(), 8 * 5_000);
    }

    #[test]
    fn test_sequence_exhaustion_waits_for_next_ms() {
        let clock = ManualClock::at(T0);
        let settings = fast_settings().with_layout(BitLayout::new(10, 1).unwrap());
        let node = SnowNode::with_clock(3, settings, clock.clone()).unwrap();

        let a = node.generate().unwrap();
        let b = node.generate().unwrap();
        assert_eq!(node.decompose(a).sequence, 0);
        assert_eq!(node.decompose(b).sequence, 1);

        // Frozen clock: the spin gives up instead of reusing a sequence.
        assert!(matches!(
            node.generate(),
            Err(SnowflakeError::ClockStalled { .. })
        ));
        assert!(matches!(
            node.generate(),
            Err(SnowflakeError::ClockStalled { .. })
        ));

        clock.set(T0 + 1);
        let c = node.generate().unwrap();
        assert!(c > b);
        assert_eq!(node.decompose(c).timestamp_ms, T0 + 1);
        assert_eq!(node.decompose(c).sequence, 0);
    }

    #[test]
    fn test_sequence_exhaustion_resumes_when_clock_advances() {
        let clock = ManualClock::at(T0);
        let settings = Settings::default().with_layout(BitLayout::new(10, 1).unwrap());
        let node = SnowNode::with_clock(3, settings, clock.clone()).unwrap();
        node.generate().unwrap();
        let b = node.generate().unwrap();

        let ticker = {
            let clock = clock.clone();
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(20));
                clock.set(T0 + 1);
            })
        };
        let c = node.generate().unwrap();
        ticker.join().unwrap();

        assert!(c > b);
        assert_eq!(node.decompose(c).timestamp_ms, T0 + 1);
    }

    #[test]
    fn test_large_clock_regression_rejected() {
        let clock = ManualClock::at(T0);
        let node = SnowNode::with_clock(1, fast_settings(), clock.clone()).unwrap();
        node.generate().unwrap();

        clock.set(T0 - 100);
        let err = node.generate().unwrap_err();
        assert!(matches!(err, SnowflakeError::ClockMovedBackwards { .. }));
        assert!(err.is_retryable());
    }

    #[test]
    fn test_small_clock_regression_is_waited_out() {
        let clock = ManualClock::at(T0);
        let node = SnowNode::with_clock(1, fast_settings(), clock.clone()).unwrap();
        let before = node.generate().unwrap();

        clock.set(T0 - 2);
        assert!(matches!(
            node.generate(),
            Err(SnowflakeError::ClockStalled { .. })
        ));

        clock.set(T0);
        let after = node.generate().unwrap();
        assert!(after > before);
    }

    #[test]
    fn test_halt() {
        let node = SnowNode::new(1).unwrap();
        node.generate().unwrap();
        node.halt();
        assert!(node.is_halted());
        assert_eq!(node.generate(), Err(SnowflakeError::Halted));
    }

    #[test]
    fn test_decompose() {
        let node = SnowNode::new(513).unwrap();
        let id = node.generate().unwrap();
        let parts = node.decompose(id);
        assert_eq!(parts.node, 513);
        assert!(parts.timestamp_ms >= DEFAULT_EPOCH_MS);
        let time = parts.time().unwrap();
        assert!(time.timestamp_millis() == parts.timestamp_ms);
    }

    #[test]
    fn test_custom_layout_and_epoch() {
        let clock = ManualClock::at(10_000);
        let settings = Settings::default()
            .with_epoch_ms(9_000)
            .with_layout(BitLayout::new(5, 5).unwrap());
        let node = SnowNode::with_clock(31, settings, clock).unwrap();
        let id = node.generate().unwrap();
        assert_eq!(id.as_i64(), (1_000 << 10) | (31 << 5));
        assert!(SnowNode::with_clock(
            32,
            Settings::default().with_layout(BitLayout::new(5, 5).unwrap()),
            MonotonicClock::new()
        )
        .is_err());
    }

    #[test]
    fn test_node_id_from_name() {
        let layout = BitLayout::default();
        let a = node_id_from_name("network", layout);
        let b = node_id_from_name("network", layout);
        assert_eq!(a, b);
        assert!((0..=layout.node_max()).contains(&a));

        let narrow = BitLayout::new(2, 12).unwrap();
        for name in ["a", "b", "network", "subscribe", ""] {
            let id = node_id_from_name(name, narrow);
            assert!((0..=3).contains(&id));
        }
    }
}
