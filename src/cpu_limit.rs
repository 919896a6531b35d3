//! Limits on concurrent CPU-hungry external tools.

use std::sync::LazyLock;

use tokio::sync::Semaphore;

use crate::prelude::*;

/// One permit per core, shared by every `pdftocairo` and `tesseract` process
/// we start.
static CPU_SEMAPHORE: LazyLock<Semaphore> =
    LazyLock::new(|| Semaphore::new(num_cpus::get()));

/// Call an async function while holding a permit from the CPU semaphore.
///
/// Extraction itself recognizes one region at a time, but rendering a batch
/// of documents can start many Poppler processes, and a host embedding us may
/// run several extractions side by side.
#[instrument(level = "trace", skip_all)]
pub async fn with_cpu_semaphore<Func, Fut, R>(f: Func) -> Result<R>
where
    Func: FnOnce() -> Fut,
    Fut: Future<Output = Result<R>>,
{
    let _permit = CPU_SEMAPHORE
        .acquire()
        .await
        .context("Could not acquire CPU permit")?;
    f().await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn runs_closure_and_returns_its_result() -> Result<()> {
        let value = with_cpu_semaphore(|| async { Ok(7) }).await?;
        assert_eq!(value, 7);
        Ok(())
    }
}
