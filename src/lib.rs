pub mod config;
pub mod dispatcher;
pub mod error;
pub mod frame;
pub mod http_invoker;
pub mod registry;
pub mod shutdown;
pub mod supervisor;
pub mod transport;
pub mod ws_invoker;
