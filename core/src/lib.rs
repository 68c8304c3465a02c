pub mod bus;
pub mod config;
pub mod debuggable;
pub mod dma;
pub mod hba;
pub mod scsi;
pub mod tickable;
pub mod types;
