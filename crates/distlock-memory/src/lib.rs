pub mod driver;
mod table;

pub use driver::MemoryDriver;
