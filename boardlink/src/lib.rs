//! Discovery, selection and firmware provisioning for networked
//! microcontroller boards.
//!
//! Boards are found over USB and LAN by [`discovery`], merged and narrowed to
//! one by [`select`], and driven by the commands in [`orchestrator`]. Firmware
//! reaches the board's SPI flash through the transaction codec in [`flash`],
//! with builds chosen by [`update`].

pub mod config;
pub mod device;
pub mod discovery;
pub mod error;
pub mod flash;
pub mod orchestrator;
pub mod select;
pub mod signal;
pub mod tracing;
pub mod transport;
pub mod update;

pub use error::{Error, Result};
