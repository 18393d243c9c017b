pub mod tail;

pub use tail::{TailConfig, TailInput};
