pub mod client;
pub mod discovery;
pub mod invocation;
pub mod map;
pub mod membership;
pub mod routing;
pub mod statistics;

pub use client::Client;
pub use grid_core::config::client_config::ClientConfig;
pub use grid_core::error::{ClientError, Result};
pub use map::Map;

#[cfg(test)]
mod tests {
    use tracing::Level;

    use grid_core::ext::init_logger;

    #[ctor::ctor]
    fn init() {
        init_logger(Level::DEBUG)
    }
}
