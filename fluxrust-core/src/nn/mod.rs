// Graph nodes: the block contract and the concrete blocks built on it.

pub mod block;
pub mod dot;
pub mod ravel;
pub mod softmax_ce;

// Re-export common items
pub use block::{Block, ParamUpdate};
pub use dot::DotBlock;
pub use ravel::Ravel;
pub use softmax_ce::SoftmaxCeBlock;
