pub mod config;
pub mod domain;
pub mod gather;
pub mod http;
pub mod id;
pub mod internal_auth;
pub mod merge;
pub mod provision;
pub mod schema;
pub mod shard;
pub mod tenant;
pub mod usage;
pub mod version;
