pub mod delegate;
pub mod window;

pub use delegate::PreviewDelegate;
pub use window::{AppEvent, PreviewApp};
