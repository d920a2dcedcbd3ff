pub mod create;
pub mod destroy;
pub mod get;
pub mod list;
pub mod version;
