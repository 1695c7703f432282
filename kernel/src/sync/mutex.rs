mod sleep;

pub use self::sleep::SleepLock;
