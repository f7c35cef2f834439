pub mod hex_utils;
pub mod hexdump;
pub mod processes;
pub mod resolve;
pub mod surrogate_image;
pub mod watch;
