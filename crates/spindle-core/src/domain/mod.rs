//! Domain model: ids, priorities, task state and the task record.

pub mod attempt;
pub mod ids;
pub mod options;
pub mod priority;
pub mod record;
pub mod state;

pub use attempt::{AttemptOutcome, AttemptRecord};
pub use ids::{ChainId, Id, IdMarker, TaskId};
pub use options::SubmitOptions;
pub use priority::Priority;
pub use record::{Callback, TaskOutcome, TaskRecord, TaskSnapshot};
pub use state::TaskState;
