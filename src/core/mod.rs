pub mod context;
pub mod indexer;
pub mod interpreter;
pub mod queue;
pub mod resolution;

pub use context::{Context, SharedContext};
pub use indexer::Indexer;
pub use interpreter::{Interpreter, Outcome};
pub use queue::{Queue, QueueBuffer, QueueHandler};
pub use resolution::{Resolution, Resolvable};
