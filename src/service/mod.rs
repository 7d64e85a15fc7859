// ABOUTME: Service module: composition root for the link manager
// ABOUTME: Provides the executor-backed service, its handle, configuration and CLI arguments

mod cli;
mod completion;
mod config;
mod observer;
mod service;

pub use cli::ServiceArgs;
pub use completion::{Completion, CompletionHandle};
pub use config::ServiceConfig;
pub use observer::{LogObserver, StatusObserver};
pub use service::{LinkService, LinkServiceBuilder, ServiceHandle};

pub(crate) use service::ServiceMessage;
