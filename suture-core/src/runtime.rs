//! Tokio runtime for the gateway.
//!
//! Multi-threaded work-stealing scheduler with named workers. When pinning
//! is enabled each of the first N workers is bound to one core.

use std::sync::atomic::{AtomicUsize, Ordering};

use tokio::runtime::{Builder, Runtime};
use tracing::{debug, info, warn};

static WORKER_COUNTER: AtomicUsize = AtomicUsize::new(0);

#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Worker threads (default: available cores)
    pub worker_threads: usize,
    pub max_blocking_threads: usize,
    pub enable_cpu_pinning: bool,
    pub thread_stack_size: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            worker_threads: num_cpus(),
            max_blocking_threads: 4,
            enable_cpu_pinning: true,
            thread_stack_size: 2 * 1024 * 1024,
        }
    }
}

#[inline]
fn num_cpus() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}

/// Build the gateway runtime.
///
/// ```
/// use suture_core::runtime::{build_runtime, RuntimeConfig};
///
/// let config = RuntimeConfig { worker_threads: 1, enable_cpu_pinning: false, ..Default::default() };
/// let rt = build_runtime(config).expect("runtime build failed");
/// rt.block_on(async {});
/// ```
pub fn build_runtime(config: RuntimeConfig) -> std::io::Result<Runtime> {
    let core_ids = if config.enable_cpu_pinning {
        core_affinity::get_core_ids().unwrap_or_default()
    } else {
        Vec::new()
    };
    let pinning = !core_ids.is_empty();

    info!(
        worker_threads = config.worker_threads,
        blocking_threads = config.max_blocking_threads,
        cpu_pinning = pinning,
        "Building gateway runtime"
    );

    Builder::new_multi_thread()
        .worker_threads(config.worker_threads)
        .max_blocking_threads(config.max_blocking_threads)
        .thread_stack_size(config.thread_stack_size)
        .enable_all()
        .thread_name_fn(|| {
            let id = WORKER_COUNTER.fetch_add(1, Ordering::Relaxed);
            format!("suture-worker-{id}")
        })
        .on_thread_start(move || {
            let worker_id = WORKER_COUNTER.load(Ordering::Relaxed).saturating_sub(1);
            let Some(&core_id) = core_ids.get(worker_id) else {
                return;
            };
            if core_affinity::set_for_current(core_id) {
                debug!(worker_id, core_id = core_id.id, "Worker thread pinned to core");
            } else {
                warn!(worker_id, core_id = core_id.id, "Failed to pin worker to core");
            }
        })
        .build()
}
