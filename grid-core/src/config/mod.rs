use config::Source;

pub mod client_config;
pub mod network;
pub mod retry;

pub trait ConfigBuilder: Sized {
    type C;

    fn add_source<T>(self, source: T) -> crate::error::Result<Self>
    where
        T: Source + Send + Sync + 'static;

    fn build(self) -> crate::error::Result<Self::C>;
}
