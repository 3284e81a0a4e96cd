pub mod driver;
pub mod installer;
pub mod node;
pub mod reconciler;
pub mod runner;
pub mod sync;
pub mod watcher;
