mod clone3;
mod mount;

pub use clone3::*;
pub use mount::*;
