pub mod context;

pub use context::EdgeContext;
