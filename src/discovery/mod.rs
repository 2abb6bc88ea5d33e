// Discovery collaborators: collector contract, progress tracking and the cancel registry
pub mod collector;
pub mod progress;
pub mod registry;

pub use collector::{Collector, CollectorFactory};
pub use progress::{DbProgressTracker, ProgressTracker};
pub use registry::CancelRegistry;
