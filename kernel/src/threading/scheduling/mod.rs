mod wait_queue;

pub use wait_queue::{WaitQueue, WakeToken, Waiter};
