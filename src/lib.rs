pub mod dex;
pub mod image;
pub mod linker;
pub mod memory;
pub mod oat;
pub mod object;
mod os;
pub mod vm;
