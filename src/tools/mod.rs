//! Agent-facing tools over a [`Session`](crate::session::Session).

pub mod gui;
pub mod traits;

pub use gui::GuiTool;
pub use traits::{Tool, ToolResult};
