//! GenStore - durable storage for async image-generation tasks
//!
//! The `ai_tasks` table is the single source of truth for the generation
//! pipeline. The API layer inserts PENDING rows; the worker daemon drives
//! every subsequent status transition. Rows are never deleted by the
//! pipeline itself - only the explicit `cleanup` maintenance command
//! removes aged-out terminal rows.
//!
//! # Modules
//!
//! - [`task`] - Task record, status/type enums, and update payloads
//! - [`store`] - `TaskStore` trait and the SQLite implementation

pub mod store;
pub mod task;

pub use store::{SqliteTaskStore, TaskStore};
pub use task::{EntityType, NewTask, Task, TaskStatus, TaskType, TaskUpdate};
