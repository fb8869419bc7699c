pub mod broadcaster;
pub mod protocol;
pub mod rate_limit;
pub mod registry;
pub mod rest;
pub mod websocket;
