mod reconstruct;
mod store;
mod types;

pub use reconstruct::reconstruct;
pub use store::PipelineStore;
pub use types::{MainBranch, Pipeline};
