pub mod ext;
pub mod macros;
pub mod stack;
pub mod status_code;
pub mod types;

// Publicly re-export all error types so callers can write
// `nsqlink_error::NsqError` instead of walking the module tree.
pub use ext::*;
pub use macros::*;
pub use stack::*;
pub use status_code::*;
pub use types::*;

pub type NsqResult<T> = Result<T, StackError>;
