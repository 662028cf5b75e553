//! Adapters: concrete implementations of the hexagonal port traits.
//!
//! | Adapter        | Implements           | Connects to                 |
//! |----------------|----------------------|-----------------------------|
//! | `log_sink`     | EventSink, AuditSink | `log` facade                |
//! | `memory_store` | PersistencePort      | postcard-encoded record vec |
//! | `sim`          | SensorPort, PumpPort | simulated patient model     |
//! | `time`         | Clock                | host clock / manual clock   |

pub mod log_sink;
pub mod memory_store;
pub mod sim;
pub mod time;
