pub mod background;
pub mod logging;
pub mod retry;
