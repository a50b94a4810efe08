pub mod changes;
pub mod common;
pub mod incidents;
pub mod pending;
pub mod settings;
pub mod worksites;
