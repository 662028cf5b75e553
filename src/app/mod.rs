//! Application core: cycle orchestration with no direct I/O.
//!
//! The dosing loop's business rules live here: the [`service`] runs one
//! cycle through the FSM, the [`runner`] keeps cycles strictly serialized,
//! and every collaborator is reached through the **port traits** in
//! [`ports`], so the whole core runs against mocks in tests.

pub mod commands;
pub mod cycle;
pub mod events;
pub mod ports;
pub mod runner;
pub mod service;
