//! Bounded-concurrency file transfer into pods.
//!
//! Copies are dispatched through a stream with a concurrency limit, so
//! cancelling (dropping) the returned future stops dispatching new files and
//! never leaves the pool running behind the caller's back.

use crate::fabric::{
    exec::{Executor, Target},
    Error,
};
use futures::stream::{self, TryStreamExt};
use std::path::PathBuf;
use tracing::debug;

/// Maximum files copied into a pod concurrently
pub const DEFAULT_CONCURRENCY: usize = 4;

/// Copies every (local, remote) pair into the target pod
pub async fn copy_all<E: Executor>(
    exec: &E,
    target: &Target,
    files: &[(PathBuf, String)],
    concurrency: usize,
) -> Result<(), Error> {
    stream::iter(files.iter().map(Ok::<_, Error>))
        .try_for_each_concurrent(concurrency, |(local, remote)| async move {
            debug!(local = %local.display(), remote = remote.as_str(), "transferring file");
            exec.copy(target, local, remote).await
        })
        .await
}
