use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    IO(#[from] std::io::Error),

    #[error(transparent)]
    Pool(#[from] crate::server::connection_pool::PoolError),

    #[error(transparent)]
    Ipmi(#[from] crate::ipmi::IpmiError),

    #[error("Server error: {0}")]
    Server(String),

    #[error("Configuration error: {0}")]
    Config(String),
}
