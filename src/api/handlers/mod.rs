pub mod contact;
pub mod health;
pub mod types;
pub mod utils;
