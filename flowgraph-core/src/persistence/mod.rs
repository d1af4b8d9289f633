pub mod dto;
pub mod migration;
pub mod yaml;

pub use dto::GraphDto;
pub use migration::MigrationRegistry;
pub use yaml::Persistence;
