pub mod base;
pub mod logging;
pub mod session;
pub mod voice;

pub use base::*;
pub use logging::*;
pub use session::*;
pub use voice::*;
