pub mod authenticator;
pub mod codec;
pub mod connection;
pub mod registry;
pub mod tls;
pub mod transport;

#[cfg(test)]
mod tests {
    use tracing::Level;

    use grid_core::ext::init_logger;

    #[ctor::ctor]
    fn init() {
        init_logger(Level::DEBUG)
    }
}
