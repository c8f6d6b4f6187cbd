mod config;
mod coordinator;
mod error;
mod lock;
mod provider;
mod text;

pub mod eppo;
pub mod eu;

pub use config::{parse_types, EppoConfig, EuConfig};
pub use coordinator::Coordinator;
pub use error::Error;
pub use lock::LockFile;
pub use provider::{BuildOptions, Provider, ProviderStore};
pub use text::{fold, fts_prefix_query};

pub type Result<T> = std::result::Result<T, Error>;
