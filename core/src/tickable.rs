use anyhow::Result;

use crate::bus::HostContext;

/// Representation of X amount of ticks of emulated time.
/// One tick is one nanosecond.
pub type Ticks = u64;

pub const TICKS_PER_USEC: Ticks = 1_000;
pub const TICKS_PER_SEC: Ticks = 1_000_000_000;

/// Anything that performs deferred work as emulated time passes.
///
/// The surrounding emulator calls `tick()` with the amount of time that
/// elapsed since the previous call, injecting guest memory and the
/// device registry through the context.
pub trait Tickable {
    fn tick(&mut self, ctx: &mut HostContext<'_>, ticks: Ticks) -> Result<Ticks>;
}
