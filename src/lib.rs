pub mod config;
pub mod framebuffer;
pub mod pipeline;
pub mod process;
pub mod qmp;
pub mod resources;
pub mod rfb;
pub mod session;
pub mod template;
pub mod tokenize;
pub mod vars;
