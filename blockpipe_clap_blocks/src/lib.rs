//! Building blocks for [`clap`]-driven configuration of the blockpipe binary.
//!
//! Every option is available both as a long flag and as a `BLOCKPIPE_*` environment variable.
pub mod pipeline;
pub mod source;
pub mod storage;
pub mod tokio;
