pub mod grep;

pub use grep::GrepFilter;
