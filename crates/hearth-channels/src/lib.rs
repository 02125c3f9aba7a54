pub mod commands;
pub mod config;
pub mod discord;
pub mod dispatcher;
pub mod feed_http;
pub mod gateway;
pub mod voice;
