pub mod config;
pub mod db;
mod migrations;

pub use config::{
    ApplicationType, ConfigStore, Connection, DnsProviderKind, NewConnection, Setting, SslProvider,
};
pub use db::Db;
