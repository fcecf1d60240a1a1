pub mod caller;

pub use caller::{CallerContext, Role};
