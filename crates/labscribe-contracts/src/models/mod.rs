mod registry;
mod selectors;

pub use registry::{ModelRegistry, ModelSpec};
pub use selectors::{ModelSelection, ModelSelector};

pub const VISION: &str = "vision";
pub const TOOLS: &str = "tools";
