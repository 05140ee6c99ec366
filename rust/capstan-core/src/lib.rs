#![doc = include_str!("../README.md")]
#![forbid(unsafe_code)]

mod answer;
mod brand;
mod capability;
mod error;
mod message;
mod method;

pub use answer::*;
pub use brand::*;
pub use capability::*;
pub use error::*;
pub use message::*;
pub use method::*;

// Re-export the cancellation token so implementors of `ClientHook` do not need
// a direct tokio-util dependency.
pub use tokio_util::sync::CancellationToken;
