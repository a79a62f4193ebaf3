//! Ports: seams the engine depends on instead of concrete services.
//!
//! - **Clock**: wall-clock timestamps (`SystemClock`, `FixedClock` for tests)
//! - **IdGenerator**: task/chain ids (`UlidGenerator`)

pub mod clock;
pub mod id_generator;

pub use self::clock::{Clock, FixedClock, SystemClock};
pub use self::id_generator::{IdGenerator, UlidGenerator};
