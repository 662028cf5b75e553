//! Integration test driver for `tests/integration/` submodules.
//!
//! Each `mod` below maps to a file that exercises one slice of the loop
//! against mock collaborators.  Everything runs on the host; no pump or
//! sensor is required.

mod cycle_tests;
mod dispatch_tests;
mod mock_hw;
mod scenario_tests;
