pub mod ecs;
pub mod matchers;
pub mod ttl;

pub use ecs::EcsPlugin;
pub use matchers::{QNameSuffixMatcher, QTypeMatcher, RcodeMatcher};
pub use ttl::TtlPlugin;
