pub mod entities;
pub mod events;

pub use entities::{
    BackendState, BackendStatus, QueueStatus, Strategy, SystemStats, Task, TaskState,
};
pub use events::{ManagementEvent, TaskSummary};
