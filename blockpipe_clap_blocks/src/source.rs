//! Config for connecting to the change-log source.

use secrecy::Secret;
use thiserror::Error;

#[derive(Debug, Clone, Copy, Error)]
pub enum SourceConfigError {
    #[error("--use-private-network requires --source-private-endpoint to be set")]
    MissingPrivateEndpoint,

    #[error("--access-key-secret is set without --access-key-id")]
    SecretWithoutKeyId,
}

/// CLI config for the change-log source.
#[derive(Debug, clap::Parser)]
pub struct SourceConfig {
    /// Public endpoint of the change-log source.
    #[clap(long = "source-endpoint", env = "BLOCKPIPE_SOURCE_ENDPOINT", action)]
    pub endpoint: String,

    /// Endpoint reachable over the private network path.
    #[clap(
        long = "source-private-endpoint",
        env = "BLOCKPIPE_SOURCE_PRIVATE_ENDPOINT",
        action
    )]
    pub private_endpoint: Option<String>,

    /// Connect over the private network path instead of the public one.
    #[clap(
        long = "use-private-network",
        env = "BLOCKPIPE_USE_PRIVATE_NETWORK",
        default_value_t = false,
        action
    )]
    pub use_private_network: bool,

    /// Access key id used to authenticate with the source.
    #[clap(long = "access-key-id", env = "BLOCKPIPE_ACCESS_KEY_ID", action)]
    pub access_key_id: Option<String>,

    /// Access key secret used to authenticate with the source.
    #[clap(long = "access-key-secret", env = "BLOCKPIPE_ACCESS_KEY_SECRET", action)]
    pub access_key_secret: Option<Secret<String>>,

    /// Unique identifier of this consumer session at the source.
    #[clap(long = "consumer-id", env = "BLOCKPIPE_CONSUMER_ID", action)]
    pub consumer_id: String,
}

impl SourceConfig {
    /// The endpoint to connect to, honouring `--use-private-network`.
    pub fn endpoint(&self) -> Result<&str, SourceConfigError> {
        if self.use_private_network {
            self.private_endpoint
                .as_deref()
                .ok_or(SourceConfigError::MissingPrivateEndpoint)
        } else {
            Ok(&self.endpoint)
        }
    }

    /// Validate that the credential options were given together.
    pub fn validate(&self) -> Result<(), SourceConfigError> {
        if self.access_key_secret.is_some() && self.access_key_id.is_none() {
            return Err(SourceConfigError::SecretWithoutKeyId);
        }
        self.endpoint().map(|_| ())
    }
}
