mod batches;
mod discovery;
mod repositories;
mod workers;

pub use batches::*;
pub use discovery::*;
pub use repositories::*;
pub use workers::*;
