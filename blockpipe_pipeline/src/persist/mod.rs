mod handle;
mod worker;

pub(crate) use handle::PersistHandle;
pub(crate) use worker::PersistWorker;
