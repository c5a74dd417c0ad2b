// Storage layer for persistent data

pub mod channels;
pub mod database;
pub mod tasks;
pub mod users;

pub use channels::ChannelRepository;
pub use database::Database;
pub use tasks::TaskRepository;
pub use users::{Identity, QuotaStore, UserDirectory, UserRepository, ROLE_ADMIN, ROLE_COMMON};
