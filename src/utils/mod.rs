//! Small shared helpers

pub mod text;

pub use text::cap_chars;
