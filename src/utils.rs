mod cancel;
mod latch;
mod logger;

pub use self::cancel::CancelToken;
pub use self::latch::Latched;
pub use self::logger::init_log;
