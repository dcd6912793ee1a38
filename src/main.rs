use anyhow::{Context, Result, bail};
use std::env;
use std::path::{Path, PathBuf};

mod labels;
mod runtime;
mod simulate;

use labels::{BuildConfig, enumerate_labels};
use labels::tree::Topology;
use simulate::types::env_flag;

enum RunMode {
    Build {
        tree: PathBuf,
        outdir: PathBuf,
        labels_only: bool,
    },
    Resume {
        dir: PathBuf,
    },
}

fn usage() -> ! {
    eprintln!(
        "usage: admixgen <tree.nwk> [outdir]\n       admixgen --labels-only <tree.nwk> [outdir]\n       admixgen --resume <outdir>"
    );
    std::process::exit(1);
}

fn default_db_dir(tree: &Path) -> PathBuf {
    let parent = tree
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    let stem = tree
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("database");
    parent.join(format!("{stem}.admixdb"))
}

fn parse_args() -> Result<RunMode> {
    let mut args = env::args().skip(1);
    let mut first = args.next().unwrap_or_else(|| usage());

    if first == "--resume" {
        let dir = args.next().unwrap_or_else(|| usage());
        return Ok(RunMode::Resume {
            dir: PathBuf::from(dir),
        });
    }

    let labels_only = first == "--labels-only";
    if labels_only {
        first = args.next().unwrap_or_else(|| usage());
    }

    let tree = PathBuf::from(first);
    if !tree.exists() {
        bail!("tree file {:?} does not exist", tree);
    }

    let outdir = if let Some(explicit) = args.next() {
        PathBuf::from(explicit)
    } else if let Ok(from_env) = env::var("ADMIX_DB_DIR") {
        PathBuf::from(from_env)
    } else {
        default_db_dir(&tree)
    };

    Ok(RunMode::Build {
        tree,
        outdir,
        labels_only,
    })
}

fn build(tree_path: &Path, outdir: &Path, labels_only: bool) -> Result<()> {
    let newick = std::fs::read_to_string(tree_path)
        .with_context(|| format!("read {}", tree_path.display()))?;
    let tree = Topology::from_newick(&newick)?;
    let cfg = BuildConfig::from_env()?;

    if simulate::io::labels_path(outdir).exists() {
        if env_flag("ADMIX_FORCE") {
            eprintln!(
                "[enumerate] ADMIX_FORCE set; overwriting {}",
                outdir.display()
            );
        } else {
            bail!(
                "database {} already exists; use --resume to continue it or \
                 set ADMIX_FORCE=1 to overwrite",
                outdir.display()
            );
        }
    }
    std::fs::create_dir_all(outdir).with_context(|| format!("create dir {}", outdir.display()))?;

    eprintln!(
        "[enumerate] reading {} ({} tips, {} candidate edges)",
        tree_path.display(),
        tree.ntips(),
        tree.candidate_edges().len()
    );
    let db = enumerate_labels(&tree, &cfg)?;
    simulate::io::save_database(outdir, &db)?;
    eprintln!(
        "[enumerate] stored {} labels ({} quartets each) to {}",
        db.nvalues(),
        db.nquarts(),
        outdir.display()
    );

    if labels_only {
        return Ok(());
    }
    simulate::fill_counts(outdir, &db)
}

fn resume(dir: &Path) -> Result<()> {
    eprintln!("[resume] loading database from {}", dir.display());
    let db = simulate::io::load_database(dir)?;
    simulate::fill_counts(dir, &db)
}

fn main() -> Result<()> {
    runtime::configure_thread_pool();

    match parse_args()? {
        RunMode::Build {
            tree,
            outdir,
            labels_only,
        } => build(&tree, &outdir, labels_only),
        RunMode::Resume { dir } => resume(&dir),
    }
}
