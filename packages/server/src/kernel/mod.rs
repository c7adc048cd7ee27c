// Kernel - core infrastructure with dependency injection
//
// Infrastructure only: the durable bus, the work queue, the substrate
// store, and the capability traits agents depend on. Business logic lives
// in the domain layers.

pub mod bus;
#[allow(clippy::module_inception)]
pub mod kernel;
pub mod store;
pub mod traits;
pub mod work;

pub use kernel::Kernel;
pub use traits::{Embedder, NoTools, Reasoner, ToolProvider};
