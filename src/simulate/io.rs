use anyhow::{Context, Result, bail};
use memmap2::MmapMut;
use ndarray::{Array1, Array2, ArrayViewMut4};
use ndarray_npy::{NpzReader, NpzWriter, ViewMutNpyExt, write_zeroed_npy};
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use crate::labels::tree::Topology;
use crate::simulate::types::Database;

pub const LABELS_FILE: &str = "labels.npz";
pub const COUNTS_FILE: &str = "counts.npy";
pub const DONE_FILE: &str = "done.npy";

pub fn labels_path(dir: &Path) -> PathBuf {
    dir.join(LABELS_FILE)
}

pub fn counts_path(dir: &Path) -> PathBuf {
    dir.join(COUNTS_FILE)
}

fn read_f64_2d<R: std::io::Read + std::io::Seek>(
    npz: &mut NpzReader<R>,
    name: &str,
) -> Result<Array2<f64>> {
    let arr: Array2<f64> = npz
        .by_name(name)
        .with_context(|| format!("missing {}", name))?;
    Ok(arr)
}

fn read_u8_2d<R: std::io::Read + std::io::Seek>(
    npz: &mut NpzReader<R>,
    name: &str,
) -> Result<Array2<u8>> {
    let arr: Array2<u8> = npz
        .by_name(name)
        .with_context(|| format!("missing {}", name))?;
    Ok(arr)
}

fn read_i64_scalar<R: std::io::Read + std::io::Seek>(
    npz: &mut NpzReader<R>,
    name: &str,
) -> Result<i64> {
    let arr: Array1<i64> = npz
        .by_name(name)
        .with_context(|| format!("missing {}", name))?;
    if arr.len() != 1 {
        bail!("{} should hold a single value, found {}", name, arr.len());
    }
    Ok(arr[0])
}

/// Write the label side of a freshly enumerated database. The directory must
/// already exist; `counts.npy` and `done.npy` are created alongside.
pub fn save_database(dir: &Path, db: &Database) -> Result<()> {
    let path = labels_path(dir);
    let f = File::create(&path).with_context(|| format!("create {}", path.display()))?;
    let mut npz = NpzWriter::new(f);

    let newick = db.tree.to_newick();
    npz.add_array(
        "meta_tree.npy",
        &Array1::from_vec(newick.into_bytes()),
    )?;
    npz.add_array(
        "meta_nsnps.npy",
        &Array1::from_vec(vec![db.nsnps as i64]),
    )?;
    npz.add_array(
        "meta_nedges.npy",
        &Array1::from_vec(vec![db.nedges as i64]),
    )?;
    npz.add_array("meta_seed.npy", &Array1::from_vec(vec![db.seed]))?;

    npz.add_array("thetas.npy", &db.thetas)?;
    npz.add_array("admix_sources.npy", &db.admix_sources)?;
    npz.add_array("admix_targets.npy", &db.admix_targets)?;
    npz.add_array("admix_props.npy", &db.admix_props)?;
    npz.add_array("admix_tstarts.npy", &db.admix_tstarts)?;
    npz.add_array("admix_tends.npy", &db.admix_tends)?;
    npz.add_array("node_heights.npy", &db.node_heights)?;
    npz.finish().context("finalize labels.npz")?;

    create_counts(dir, db.nvalues(), db.nquarts())?;
    write_done(dir, 0)?;
    Ok(())
}

pub fn load_database(dir: &Path) -> Result<Database> {
    let path = labels_path(dir);
    let f = File::open(&path).with_context(|| format!("open {}", path.display()))?;
    let mut npz = NpzReader::new(f).context("read labels.npz")?;

    let tree_bytes: Array1<u8> = npz.by_name("meta_tree.npy").context("missing meta_tree")?;
    let newick = String::from_utf8(tree_bytes.to_vec()).context("stored tree is not UTF-8")?;
    let tree = Topology::from_newick(&newick)?;

    let nsnps = read_i64_scalar(&mut npz, "meta_nsnps.npy")? as usize;
    let nedges = read_i64_scalar(&mut npz, "meta_nedges.npy")? as usize;
    let seed_arr: Array1<u64> = npz.by_name("meta_seed.npy").context("missing meta_seed")?;
    if seed_arr.len() != 1 {
        bail!("meta_seed should hold a single value");
    }

    let thetas: Array1<f64> = npz.by_name("thetas.npy").context("missing thetas")?;
    let db = Database {
        tree,
        nsnps,
        nedges,
        seed: seed_arr[0],
        thetas,
        admix_sources: read_u8_2d(&mut npz, "admix_sources.npy")?,
        admix_targets: read_u8_2d(&mut npz, "admix_targets.npy")?,
        admix_props: read_f64_2d(&mut npz, "admix_props.npy")?,
        admix_tstarts: read_f64_2d(&mut npz, "admix_tstarts.npy")?,
        admix_tends: read_f64_2d(&mut npz, "admix_tends.npy")?,
        node_heights: read_f64_2d(&mut npz, "node_heights.npy")?,
    };
    db.validate()?;
    Ok(db)
}

/// Pre-allocate the zeroed count store at its final shape. Sparse on
/// filesystems that support it, so creation is cheap even for large spaces.
fn create_counts(dir: &Path, nvalues: usize, nquarts: usize) -> Result<()> {
    let path = counts_path(dir);
    let f = File::create(&path).with_context(|| format!("create {}", path.display()))?;
    write_zeroed_npy::<u32, _>(&f, (nvalues, nquarts, 16, 16))
        .with_context(|| format!("allocate {}", path.display()))?;
    Ok(())
}

/// Map the count store read-write. The caller views it with
/// [`counts_view_mut`] and is the only writer.
pub fn map_counts(dir: &Path) -> Result<MmapMut> {
    let path = counts_path(dir);
    let f = OpenOptions::new()
        .read(true)
        .write(true)
        .open(&path)
        .with_context(|| format!("open {}", path.display()))?;
    let mmap = unsafe { MmapMut::map_mut(&f) }
        .with_context(|| format!("memory-map {}", path.display()))?;
    Ok(mmap)
}

pub fn counts_view_mut<'a>(
    mmap: &'a mut MmapMut,
    nvalues: usize,
    nquarts: usize,
) -> Result<ArrayViewMut4<'a, u32>> {
    let view = ArrayViewMut4::<u32>::view_mut_npy(&mut mmap[..])
        .context("counts.npy does not match the expected u32 layout")?;
    if view.shape() != [nvalues, nquarts, 16, 16] {
        bail!(
            "counts.npy has shape {:?}, expected [{}, {}, 16, 16]; stale store?",
            view.shape(),
            nvalues,
            nquarts
        );
    }
    Ok(view)
}

/// Completion watermark: the number of leading rows whose counts are final.
pub fn read_done(dir: &Path) -> Result<usize> {
    let path = dir.join(DONE_FILE);
    let arr: Array1<i64> =
        ndarray_npy::read_npy(&path).with_context(|| format!("read {}", path.display()))?;
    if arr.len() != 1 || arr[0] < 0 {
        bail!("corrupt watermark in {}", path.display());
    }
    Ok(arr[0] as usize)
}

/// Advance the watermark with a write-then-rename so an interrupt never
/// leaves a torn marker.
pub fn write_done(dir: &Path, done: usize) -> Result<()> {
    let path = dir.join(DONE_FILE);
    let tmp = dir.join(format!("{}.tmp", DONE_FILE));
    ndarray_npy::write_npy(&tmp, &Array1::from_vec(vec![done as i64]))
        .with_context(|| format!("write {}", tmp.display()))?;
    std::fs::rename(&tmp, &path)
        .with_context(|| format!("rename {} -> {}", tmp.display(), path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{Array1, Array2};

    fn tiny_database() -> Database {
        let tree = Topology::from_newick("((0,1),(2,3));").unwrap();
        let nvalues = 6;
        Database {
            tree,
            nsnps: 12,
            nedges: 1,
            seed: 42,
            thetas: Array1::linspace(0.01, 0.02, nvalues),
            admix_sources: Array2::from_elem((nvalues, 1), 2u8),
            admix_targets: Array2::from_elem((nvalues, 1), 0u8),
            admix_props: Array2::from_elem((nvalues, 1), 0.2),
            admix_tstarts: Array2::from_elem((nvalues, 1), 0.1),
            admix_tends: Array2::from_elem((nvalues, 1), 0.6),
            node_heights: Array2::from_elem((nvalues, 3), 1.0),
        }
    }

    fn scratch_dir(tag: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "admixgen-io-{}-{}",
            tag,
            std::process::id()
        ));
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn database_survives_save_and_load() {
        let dir = scratch_dir("roundtrip");
        let db = tiny_database();
        save_database(&dir, &db).unwrap();

        let back = load_database(&dir).unwrap();
        assert_eq!(back.nvalues(), 6);
        assert_eq!(back.nsnps, 12);
        assert_eq!(back.nedges, 1);
        assert_eq!(back.seed, 42);
        assert_eq!(back.tree.to_newick(), db.tree.to_newick());
        assert_eq!(back.thetas, db.thetas);
        assert_eq!(back.admix_sources, db.admix_sources);
        assert_eq!(read_done(&dir).unwrap(), 0);
        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn counts_store_is_zeroed_and_writable_in_place() {
        let dir = scratch_dir("counts");
        let db = tiny_database();
        save_database(&dir, &db).unwrap();

        {
            let mut mmap = map_counts(&dir).unwrap();
            let mut view = counts_view_mut(&mut mmap, 6, 1).unwrap();
            assert_eq!(view.sum(), 0);
            view[[3, 0, 5, 7]] = 17;
            mmap.flush().unwrap();
        }
        let mut mmap = map_counts(&dir).unwrap();
        let view = counts_view_mut(&mut mmap, 6, 1).unwrap();
        assert_eq!(view[[3, 0, 5, 7]], 17);
        assert_eq!(view.sum(), 17);
        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn watermark_round_trips_and_rejects_garbage() {
        let dir = scratch_dir("done");
        write_done(&dir, 0).unwrap();
        assert_eq!(read_done(&dir).unwrap(), 0);
        write_done(&dir, 4321).unwrap();
        assert_eq!(read_done(&dir).unwrap(), 4321);
        std::fs::write(dir.join(DONE_FILE), b"not an npy").unwrap();
        assert!(read_done(&dir).is_err());
        std::fs::remove_dir_all(&dir).unwrap();
    }
}
