pub mod port;
pub mod values;
pub mod wire;

pub use port::Port;
pub use values::{Positional, ValueError};
pub use wire::CallSpec;
