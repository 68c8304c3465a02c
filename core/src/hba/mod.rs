//! Host bus adapters

pub mod aha154x;
pub mod buslogic;
pub mod completion;
pub mod ncr5380;
pub mod ncr53c400;
pub mod x54x;
