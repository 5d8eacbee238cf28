//! romdrop - retro game acquisition pipeline
//!
//! Downloads ROM archives, unpacks them, converts disc images to CHD
//! where the platform wants it, moves the results into per-platform
//! storage and scrapes box-art. Built to sit behind a polling frontend:
//! the scheduler exposes synchronous snapshots instead of callbacks.

pub mod config;
pub mod convert;
pub mod extract;
pub mod image_cache;
pub mod job;
pub mod notify;
pub mod platforms;
pub mod process;
pub mod scheduler;
pub mod scrape;
pub mod worker;

#[cfg(test)]
mod test_http;
