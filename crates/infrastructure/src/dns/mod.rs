pub mod cache;
pub mod forward;
pub mod plugins;
pub mod pool;
pub mod racing;
pub mod singleflight;
pub mod upstream;
pub mod wire;

pub use cache::plugin::{CachePlugin, CachePluginOpts};
pub use forward::ForwardPlugin;
pub use pool::BufferPool;
pub use racing::exchange_parallel;
pub use upstream::{Reply, Upstream};
