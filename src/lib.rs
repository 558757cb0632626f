//! Flash translation layer for raw NOR flash.
//!
//! Presents a fixed number of logical sectors on top of a medium that can only
//! erase whole blocks and clear bits. Writes go out of place into erased
//! sectors; superseded sectors are reclaimed block by block, with erase
//! counts kept in each block header for wear leveling. The logical-to-physical
//! map lives in RAM and is rebuilt from the sector headers on mount, so any
//! sequence of flash operations cut short by a power loss mounts cleanly.

#[macro_use]
extern crate log;

pub mod block_dev;
pub mod config;
pub mod error;
pub mod flash;
pub mod ftl;
pub mod geometry;
pub mod layout;
mod mount;
mod reclaim;
mod tables;

#[cfg(test)]
mod test_util;

pub use block_dev::{BlockDevInfo, BlockDevice};
pub use config::FtlConfig;
pub use error::{FlashError, FtlError, Result};
pub use flash::{FlashGeometry, NorFlash, RamFlash};
pub use ftl::{Ftl, FtlStats, FtlUsage};
pub use geometry::Geometry;
