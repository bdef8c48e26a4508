//! Core constants used by the ring buffer and topic processor.

/// Default backlog (ring capacity) when none is configured
pub const DEFAULT_BACKLOG: usize = 1024;

/// Smallest ring capacity a processor will allocate
pub const MIN_CAPACITY: usize = 2;

/// Largest ring capacity a processor will allocate
pub const MAX_CAPACITY: usize = 1 << 30;

/// Initial value of every cursor: nothing claimed or consumed yet
pub const INITIAL_CURSOR_VALUE: i64 = -1;

/// Spins before a waiting producer or consumer starts yielding
pub const SPIN_TRIES: u32 = 100;

/// Yields before the sleeping strategy starts sleeping
pub const YIELD_TRIES: u32 = 100;

/// Sleep step of the sleeping wait strategy, in microseconds
pub const SLEEP_STEP_MICROS: u64 = 100;

/// Default idle interval after which a batching handler flushes its residue
pub const DEFAULT_FLUSH_INTERVAL_MILLIS: u64 = 100;
