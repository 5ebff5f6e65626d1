pub mod types;
pub mod loader;
pub mod validator;
pub mod payload;

pub use types::*;
pub use loader::*;
pub use validator::*;
