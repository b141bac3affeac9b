pub mod account;
pub mod status;
