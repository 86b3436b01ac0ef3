pub mod codec;
pub mod error;
pub mod frame;
pub mod framer;
pub mod message;
pub mod planner;
pub mod session;
mod wire;

pub use error::{Error as S7Error, ErrorCode, Result as S7Result};
