use rayon::ThreadPoolBuilder;
use std::sync::Once;

/// Scheduler hints checked in order before falling back to the machine.
const THREAD_HINTS: [&str; 6] = [
    "ADMIX_THREADS",
    "RAYON_NUM_THREADS",
    "SLURM_CPUS_PER_TASK",
    "SLURM_CPUS_ON_NODE",
    "PBS_NP",
    "OMP_NUM_THREADS",
];

fn hinted_threads() -> (usize, &'static str) {
    for key in THREAD_HINTS {
        if let Some(n) = std::env::var(key)
            .ok()
            .and_then(|v| v.trim().parse::<usize>().ok())
        {
            if n > 0 {
                return (n, key);
            }
        }
    }
    let n = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1);
    (n, "available_parallelism")
}

/// Configure the global rayon pool once, honouring batch-scheduler hints so
/// cluster jobs do not oversubscribe their allocation.
pub fn configure_thread_pool() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let (count, source) = hinted_threads();
        let built = ThreadPoolBuilder::new()
            .num_threads(count)
            .thread_name(|i| format!("admixgen-worker-{i}"))
            .build_global();
        match built {
            Ok(()) => {
                eprintln!("[threads] rayon pool = {count} threads (hint: {source})");
            }
            Err(err) => {
                eprintln!(
                    "[threads] warn: failed to configure rayon pool ({err}); continuing with default"
                );
            }
        }
    });
}
