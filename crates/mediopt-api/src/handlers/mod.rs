pub mod health;
pub mod optimize;
