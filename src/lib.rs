pub mod allocator;
pub mod archive;
pub mod auth;
pub mod config;
pub mod db;
pub mod dispatcher;
pub mod error;
pub mod inbox;
pub mod integrations;
pub mod lifecycle;
pub mod mailer;
pub mod models;
pub mod notify;
pub mod routes;
pub mod schema;
pub mod state;
pub mod storage;
pub mod webhooks;
pub mod workflow;

pub use dispatcher::Dispatcher;
