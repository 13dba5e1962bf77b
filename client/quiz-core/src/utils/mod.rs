pub mod keyed_lock;
pub mod retry;
pub mod time;
