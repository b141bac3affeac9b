pub mod accounts;
pub mod codes;
pub mod password;
pub mod sweeper;

pub use accounts::{AccountService, AccountSettings};
pub use sweeper::{SWEEP_INTERVAL, spawn_sweeper};
