pub mod models;
pub mod ports;
pub mod store;

pub use models::{Task, TaskKind, TaskStatus};
pub use ports::{PortAllocator, PortError};
pub use store::{JsonTaskStore, StoreError, TaskStore};
