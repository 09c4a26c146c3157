mod codes;
mod types;

pub use codes::*;
pub use types::*;
