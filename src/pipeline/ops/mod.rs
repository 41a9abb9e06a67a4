//! Standard operations.

mod download;
mod echo;
mod emulator;
mod image_tool;
mod mark_installed;

pub use download::{format_size, Download};
pub use echo::Echo;
pub use emulator::{emulator_args, Emulator};
pub use image_tool::ImageTool;
pub use mark_installed::MarkInstalled;
