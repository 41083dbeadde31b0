//! The three core engines: recall, reflection, and forgetting.

pub mod forgetting;
pub mod recall;
pub mod reflection;

pub use forgetting::{prune, ForgettingAgent, PruneStats};
pub use recall::RecallEngine;
pub use reflection::ReflectionEngine;
