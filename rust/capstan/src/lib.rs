#![doc = include_str!("../README.md")]
#![forbid(unsafe_code)]

mod answer_queue;
mod call;
pub mod cancel;
mod error;
mod method_table;
mod outstanding;
mod queue;
mod returner;
mod server;

pub use answer_queue::AnswerQueue;
pub use call::Call;
pub use error::ServerError;
pub use method_table::*;
pub use queue::CallQueue;
pub use server::{Server, ServerBuilder, Shutdowner, is_server};

pub use capstan_core;
