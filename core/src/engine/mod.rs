pub mod copier;
pub mod progress;
pub(crate) mod queue;
pub mod scanner;
pub mod scheduler;
pub mod transport;

pub use copier::{CopyError, DirectoryTransport};
pub use progress::{ProgressEvent, ProgressHub, ProgressStatus, Subscription};
pub use queue::QueueStats;
pub use scanner::{collect_artifacts, ScanError, ScanResult};
pub use scheduler::{Scheduler, SchedulerError};
pub use transport::{TransferError, Transport};
