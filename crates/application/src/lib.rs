pub mod condition;
pub mod context;
pub mod executable;
pub mod handler;
pub mod meta;
pub mod replies;

pub use condition::{ConditionNode, ExprMatcher};
pub use context::{QueryContext, RawResponse};
pub use executable::{exec_chain, AndMatcherGroup, ChainNode, Executable, Matcher};
pub use handler::{EntryHandler, EntryHandlerOpts, GateOpts};
pub use meta::{RequestMeta, TransportProtocol};
