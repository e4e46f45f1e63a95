pub mod allowlist;
pub mod body;
pub mod config;
pub mod config_validation;
pub mod download;
pub mod error;
pub mod handler;
pub mod logging;
pub mod response;
pub mod server;
pub mod shutdown;
pub mod translate;

pub use allowlist::Allowlist;
pub use config::Config;
pub use download::{Downloader, HttpDownloader, HttpDownloaderOptions};
pub use error::{DownloadError, ProxyError};
pub use handler::ForwardingHandler;
pub use logging::Logger;
pub use server::{ProxyServer, ServerState};
pub use shutdown::{Shutdown, ShutdownReason};
