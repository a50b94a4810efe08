//! Database layer for Relief

mod change_log;
mod child_repository;
mod connection;
mod incident_repository;
mod migrations;
mod sync_parameters_repository;
mod sync_stats_repository;
mod worksite_repository;

pub use change_log::{LibSqlChangeLogRepository, LocalEditContext};
pub use child_repository::{ChildWrite, WorksiteChildRepository};
pub use connection::Database;
pub use incident_repository::LibSqlIncidentRepository;
pub use sync_parameters_repository::LibSqlSyncParametersRepository;
pub use sync_stats_repository::LibSqlSyncStatsRepository;
pub use worksite_repository::LibSqlWorksiteRepository;
