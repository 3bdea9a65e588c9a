pub mod analytics;
pub mod cache;
pub mod health;
pub mod kafka;
pub mod moex;
pub mod persistence;
pub mod shutdown;
