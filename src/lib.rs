//! apsloop closed-loop dosing engine.
//!
//! Pure-logic library: the simulator binary and the integration tests drive
//! it through the port traits in [`app::ports`].

#![deny(unused_must_use)]

pub mod activity;
pub mod adapters;
pub mod app;
pub mod audit;
pub mod config;
pub mod constraints;
pub mod dispatch;
pub mod error;
pub mod fsm;
pub mod profile;
pub mod scheduler;
pub mod strategy;
pub mod types;
