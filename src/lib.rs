// src/lib.rs
// Public library surface for integration tests (and potential reuse).

pub mod api;
pub mod clean;
pub mod collect;
pub mod error;
pub mod llm;
pub mod model;
pub mod net;
pub mod pipeline;
pub mod scheduler;
pub mod settings;
pub mod store;
pub mod strategy;
pub mod telemetry;
pub mod validate;

// ---- Re-exports for stable public API ----
pub use crate::api::{create_router, AppState};
pub use crate::error::{HarvestError, Result};
pub use crate::model::{DiscussionRecord, NormalizedRecord, RawItem, SourceKind};
