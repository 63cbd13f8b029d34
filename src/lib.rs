// Cancellable task-group controller
//
// Provides a unified interface for:
// - Spawning cancellable background tasks with unique IDs
// - Graceful cancellation via CancellationToken
// - Grouping tasks under a fault-propagation policy (fail-fast or
//   supervisor-style isolation)
// - Progress-driving loops and marshalled delivery of render calls onto a
//   single-consumer affinity context

pub mod dispatch;
pub mod error;
pub mod group;
pub mod handle;
pub mod progress;
pub mod types;

pub use dispatch::{AffinityHandle, RenderSink};
pub use error::{TaskError, TaskResult};
pub use group::TaskGroup;
pub use handle::TaskHandle;
pub use types::{GroupPolicy, GroupState, TaskInfo, TaskOutcome, TaskProgress, TaskState};

// Re-export CancellationToken for convenience
pub use tokio_util::sync::CancellationToken;
