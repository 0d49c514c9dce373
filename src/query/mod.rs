//! Query handles, ids and the active-query registry.

mod handle;
mod id;
mod registry;

pub use handle::{QueryHandle, QueryOptions};
pub use id::QueryId;
pub use registry::{ActiveQueryRegistry, Registration};
