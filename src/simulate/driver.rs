use anyhow::{Context, Result, bail};
use indicatif::{ProgressBar, ProgressStyle};
use ndarray::{Array4, s};
use rayon::prelude::*;
use std::path::Path;
use std::time::Instant;

use crate::simulate::coalescent::run_scenario;
use crate::simulate::io;
use crate::simulate::types::{Database, env_usize};

// -------------------------------------------------------------------------------------
// Tunables
// -------------------------------------------------------------------------------------

/// Rows per job; one job is the unit handed to the thread pool.
fn chunk_rows() -> Result<usize> {
    let v = env_usize("ADMIX_CHUNK", 1000)?;
    if v == 0 {
        bail!("ADMIX_CHUNK must be positive");
    }
    Ok(v)
}

/// Jobs per checkpoint wave; the store is flushed and the watermark advanced
/// after every wave.
fn wave_jobs() -> Result<usize> {
    let v = env_usize("ADMIX_WAVE", 8)?;
    if v == 0 {
        bail!("ADMIX_WAVE must be positive");
    }
    Ok(v)
}

// -------------------------------------------------------------------------------------
// Memory tracking (HPC safety)
// -------------------------------------------------------------------------------------

const MB: u64 = 1024 * 1024;
const GB: u64 = MB * 1024;

fn memory_budget_bytes() -> Option<u64> {
    let scaled = |var: &str, mult: u64| -> Option<u64> {
        std::env::var(var)
            .ok()?
            .trim()
            .parse::<u64>()
            .ok()
            .map(|v| v.saturating_mul(mult))
    };
    scaled("ADMIX_MAX_RSS_BYTES", 1)
        .or_else(|| scaled("ADMIX_MAX_RSS_MB", MB))
        .or_else(|| scaled("ADMIX_MAX_RSS_GB", GB))
}

fn current_rss_bytes() -> Option<u64> {
    let contents = std::fs::read_to_string("/proc/self/statm").ok()?;
    let mut parts = contents.split_whitespace();
    let _total = parts.next()?;
    let resident_pages: u64 = parts.next()?.parse().ok()?;
    let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if page_size <= 0 {
        return None;
    }
    Some(resident_pages.saturating_mul(page_size as u64))
}

fn bytes_to_gib(bytes: u64) -> f64 {
    bytes as f64 / GB as f64
}

fn report_memory_after_wave(done: usize, budget: Option<u64>) -> Result<()> {
    if let Some(rss) = current_rss_bytes() {
        match budget {
            Some(limit) => {
                eprintln!(
                    "[mem] done={} rss={:.2} GiB (limit {:.2} GiB)",
                    done,
                    bytes_to_gib(rss),
                    bytes_to_gib(limit)
                );
                if rss > limit {
                    bail!(
                        "RSS {:.2} GiB exceeded limit {:.2} GiB (set via ADMIX_MAX_RSS_*)",
                        bytes_to_gib(rss),
                        bytes_to_gib(limit)
                    );
                }
            }
            None => {
                eprintln!("[mem] done={} rss={:.2} GiB", done, bytes_to_gib(rss));
            }
        }
    }
    Ok(())
}

// -------------------------------------------------------------------------------------
// Parallel fill
// -------------------------------------------------------------------------------------

/// Fill count matrices for all rows past the watermark, in checkpoint waves
/// of parallel jobs. Workers return blocks; only this thread writes the
/// mapped store, so a crash or interrupt costs at most the current wave.
pub fn fill_counts(dir: &Path, db: &Database) -> Result<()> {
    let nvalues = db.nvalues();
    let nquarts = db.nquarts();
    let done = io::read_done(dir)?;
    if done >= nvalues {
        eprintln!("[run] all {} rows already simulated", nvalues);
        return Ok(());
    }

    let chunk = chunk_rows()?;
    let wave = wave_jobs()?;
    let budget = memory_budget_bytes();

    let jobs: Vec<(usize, usize)> = (done..nvalues)
        .step_by(chunk)
        .map(|start| (start, (start + chunk).min(nvalues)))
        .collect();

    eprintln!(
        "[run] {} rows remaining in {} jobs of up to {} rows",
        nvalues - done,
        jobs.len(),
        chunk
    );

    let t0 = Instant::now();
    let pb = ProgressBar::new(jobs.len() as u64);
    pb.set_style(
        ProgressStyle::with_template("[{elapsed_precise}] {bar:40} {pos}/{len} jobs {msg}")
            .unwrap()
            .progress_chars("=>-"),
    );

    let mut mmap = io::map_counts(dir)?;
    let mut watermark = done;

    for batch in jobs.chunks(wave) {
        pb.set_message(format!(
            "rows {}..{}",
            batch[0].0,
            batch[batch.len() - 1].1
        ));

        let blocks: Vec<Result<(usize, usize, Array4<u32>)>> = batch
            .par_iter()
            .map(|&(start, end)| {
                let mut block = Array4::<u32>::zeros((end - start, nquarts, 16, 16));
                for row in start..end {
                    let scenario = db.scenario(row);
                    let counts = run_scenario(&db.tree, &scenario, db.row_seed(row))
                        .with_context(|| format!("simulating row {}", row))?;
                    block.slice_mut(s![row - start, .., .., ..]).assign(&counts);
                }
                Ok((start, end, block))
            })
            .collect();

        {
            let mut view = io::counts_view_mut(&mut mmap, nvalues, nquarts)?;
            for result in blocks {
                let (start, end, block) = result?;
                view.slice_mut(s![start..end, .., .., ..]).assign(&block);
                pb.inc(1);
            }
        }
        mmap.flush().context("flush counts store")?;

        watermark = batch[batch.len() - 1].1;
        io::write_done(dir, watermark)?;
        report_memory_after_wave(watermark, budget)?;
    }

    pb.finish_and_clear();
    eprintln!(
        "[run] simulated {} rows in {:.1}s ({} total)",
        nvalues - done,
        t0.elapsed().as_secs_f64(),
        watermark
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::labels::enumerate_labels;
    use crate::labels::sampler::ThetaRange;
    use crate::labels::tree::Topology;
    use crate::labels::{BuildConfig, EdgeFunction};
    use std::path::PathBuf;

    fn scratch_dir(tag: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "admixgen-driver-{}-{}",
            tag,
            std::process::id()
        ));
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn tiny_config() -> BuildConfig {
        BuildConfig {
            nedges: 1,
            ntrees: 1,
            ntests: 2,
            nreps: 2,
            nsnps: 16,
            theta: ThetaRange::parse("0.01").unwrap(),
            seed: 123,
            edge_fn: EdgeFunction::Fixed,
        }
    }

    #[test]
    fn build_run_resume_fills_every_row_once() {
        let dir = scratch_dir("endtoend");
        let tree = Topology::from_newick("((a:1,b:1):1,(c:1,d:1):1);").unwrap();
        let db = enumerate_labels(&tree, &tiny_config()).unwrap();
        io::save_database(&dir, &db).unwrap();
        let nvalues = db.nvalues();
        assert!(nvalues > 0);

        // tiny jobs so the run spans several waves
        unsafe {
            std::env::set_var("ADMIX_CHUNK", "2");
            std::env::set_var("ADMIX_WAVE", "1");
        }
        fill_counts(&dir, &db).unwrap();
        unsafe {
            std::env::remove_var("ADMIX_CHUNK");
            std::env::remove_var("ADMIX_WAVE");
        }

        assert_eq!(io::read_done(&dir).unwrap(), nvalues);

        let mut mmap = io::map_counts(&dir).unwrap();
        let view = io::counts_view_mut(&mut mmap, nvalues, 1).unwrap();
        for row in 0..nvalues {
            assert_eq!(
                view.slice(s![row, 0, .., ..]).sum(),
                db.nsnps as u32,
                "row {} should hold one count per site",
                row
            );
        }
        drop(view);
        drop(mmap);

        // a second pass is a no-op
        fill_counts(&dir, &db).unwrap();
        std::fs::remove_dir_all(&dir).unwrap();
    }
}
