//! # beaconkit-server
//!
//! HTTP surface for the beaconkit event pipeline.
//!
//! A scanning collaborator pushes ranging samples in; hosts drive monitoring,
//! inspect the occurrence ledger and read back what was dispatched.

#![forbid(unsafe_code)]
#![warn(clippy::all, clippy::pedantic, clippy::nursery)]

pub mod api;
pub mod dispatcher;
pub mod logging;
pub mod state;
