//! Irrigation hub: sensor ingestion, valve control and manual override for a
//! single Raspberry Pi controller.

pub mod audit;
pub mod config;
pub mod control;
pub mod db;
pub mod display;
pub mod error;
pub mod pins;
pub mod sensor;
pub mod state;
pub mod web;

mod sync;
