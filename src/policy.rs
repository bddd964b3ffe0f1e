//! Configuration options which can alter the behavior of the resolver.

/// Policy which is applicable to a backend-set resolver.
#[derive(Clone, Debug)]
pub struct Policy {
    /// The port substituted for any backend spec that omits one.
    ///
    /// Default: 80
    pub default_port: u16,

    /// Capacity of the per-subscriber event channel. Must be nonzero.
    /// Slow subscribers that fall more than this many events behind
    /// start losing the oldest ones.
    ///
    /// Default: 128
    pub event_buffer: usize,
}

impl Default for Policy {
    fn default() -> Self {
        Self {
            default_port: 80,
            event_buffer: 128,
        }
    }
}
