//! Hardware access layer: GPIO, monotonic clock, thread spawning, and the
//! two-line valve drive built on top of them.

pub mod clock;
pub mod drive;
pub mod gpio;
pub mod task;
