//! Host driver for the block cache and the mapped-file manager.
//!
//! Runs a multi-threaded read/modify/write workload against a cache over an
//! image file, checks that no update was lost, then maps a file stored in
//! the same image into a process and writes it back through `munmap`.
use anyhow::{anyhow, ensure, Context, Result};
use bcache::{BlockCache, BlockDevice, BlockDeviceError, CacheConfig, CacheStats, BLOCK_SZ};
use clap::{App, Arg, ArgMatches};
use kmm::config::PAGE_SIZE;
use kmm::fs::{Extent, Inode, OSInode};
use kmm::mm::{FrameAllocator, MapFlags, MapProt, PhysRegion};
use kmm::sync::UniHart;
use kmm::task::TaskControlBlock;
use log::info;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::fs::{File, OpenOptions};
use std::io::{ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use std::thread;

/// Blocks after the stress area that hold the mapped file
const DEMO_BLOCKS: usize = 8;
const DEMO_FRAMES: usize = 16;

struct BlockFile(Mutex<File>);

impl BlockDevice for BlockFile {
    fn read_block(&self, block_id: usize, buf: &mut [u8]) -> std::result::Result<(), BlockDeviceError> {
        let mut file = self.0.lock().map_err(|_| BlockDeviceError::Failed)?;
        file.seek(SeekFrom::Start((block_id * BLOCK_SZ) as u64))
            .map_err(|_| BlockDeviceError::Failed)?;
        file.read_exact(buf).map_err(|e| match e.kind() {
            ErrorKind::UnexpectedEof => BlockDeviceError::OutOfRange(block_id),
            _ => BlockDeviceError::Failed,
        })
    }

    fn write_block(&self, block_id: usize, buf: &[u8]) -> std::result::Result<(), BlockDeviceError> {
        let mut file = self.0.lock().map_err(|_| BlockDeviceError::Failed)?;
        file.seek(SeekFrom::Start((block_id * BLOCK_SZ) as u64))
            .map_err(|_| BlockDeviceError::Failed)?;
        file.write_all(buf).map_err(|_| BlockDeviceError::Failed)
    }
}

struct Options {
    image: PathBuf,
    blocks: usize,
    threads: usize,
    iterations: usize,
    seed: u64,
    nbuf: usize,
    nbuckets: usize,
}

fn arg<T>(matches: &ArgMatches, name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match matches.value_of(name) {
        Some(v) => v.parse().with_context(|| format!("invalid --{}: {}", name, v)),
        None => Ok(default),
    }
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let matches = App::new("bcache stress")
        .arg(
            Arg::with_name("image")
                .short("i")
                .long("image")
                .takes_value(true)
                .help("Image file backing the block device"),
        )
        .arg(
            Arg::with_name("blocks")
                .short("b")
                .long("blocks")
                .takes_value(true)
                .help("Blocks touched by the workload"),
        )
        .arg(
            Arg::with_name("threads")
                .short("t")
                .long("threads")
                .takes_value(true)
                .help("Worker threads, one per simulated core"),
        )
        .arg(
            Arg::with_name("iterations")
                .short("n")
                .long("iterations")
                .takes_value(true)
                .help("Cache operations per thread"),
        )
        .arg(
            Arg::with_name("seed")
                .short("s")
                .long("seed")
                .takes_value(true)
                .help("Seed of the random block choice"),
        )
        .arg(
            Arg::with_name("nbuf")
                .long("nbuf")
                .takes_value(true)
                .help("Buffers in the cache"),
        )
        .arg(
            Arg::with_name("nbuckets")
                .long("nbuckets")
                .takes_value(true)
                .help("Hash buckets in the cache"),
        )
        .get_matches();
    let defaults = CacheConfig::default();
    let opts = Options {
        image: matches.value_of("image").unwrap_or("target/bcache.img").into(),
        blocks: arg(&matches, "blocks", 256)?,
        threads: arg(&matches, "threads", 4)?,
        iterations: arg(&matches, "iterations", 2000)?,
        seed: arg(&matches, "seed", 0)?,
        nbuf: arg(&matches, "nbuf", defaults.nbuf)?,
        nbuckets: arg(&matches, "nbuckets", defaults.nbuckets)?,
    };
    let stats = run(&opts)?;
    info!(
        "hits {}, misses {}, evictions {}",
        stats.hits, stats.misses, stats.evictions
    );
    Ok(())
}

fn run(opts: &Options) -> Result<CacheStats> {
    ensure!(opts.blocks > 0, "--blocks must be positive");
    // every worker holds at most one buffer at a time
    ensure!(
        opts.threads < opts.nbuf,
        "{} threads need more than {} buffers",
        opts.threads,
        opts.nbuf
    );
    if let Some(dir) = opts.image.parent() {
        std::fs::create_dir_all(dir)?;
    }
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(true)
        .open(&opts.image)
        .with_context(|| format!("open {}", opts.image.display()))?;
    file.set_len(((opts.blocks + DEMO_BLOCKS) * BLOCK_SZ) as u64)?;
    let device = Arc::new(BlockFile(Mutex::new(file)));
    let cache = Arc::new(BlockCache::new(
        CacheConfig {
            nbuf: opts.nbuf,
            nbuckets: opts.nbuckets,
        },
        vec![device.clone() as Arc<dyn BlockDevice>],
    ));
    info!(
        "{}: {} buffers in {} buckets",
        opts.image.display(),
        cache.capacity(),
        opts.nbuckets
    );
    stress(&cache, &*device, opts)?;
    mmap_demo(&cache, opts.blocks)?;
    Ok(cache.stats())
}

/// Random increments of per-block counters from every thread, then a check
/// against the image that every increment landed.
fn stress(cache: &BlockCache, device: &dyn BlockDevice, opts: &Options) -> Result<()> {
    let per_thread = thread::scope(|s| {
        let handles: Vec<_> = (0..opts.threads)
            .map(|t| {
                s.spawn(move || -> Result<Vec<u64>> {
                    let mut rng = StdRng::seed_from_u64(opts.seed + t as u64);
                    let mut mine = vec![0u64; opts.blocks];
                    for _ in 0..opts.iterations {
                        let blockno = rng.gen_range(0..opts.blocks);
                        let mut buf = cache.read(0, blockno)?;
                        if rng.gen_bool(0.5) {
                            buf.modify(0, |n: &mut u64| *n += 1);
                            buf.write()?;
                            mine[blockno] += 1;
                        } else {
                            buf.read(0, |n: &u64| *n);
                        }
                    }
                    Ok(mine)
                })
            })
            .collect();
        handles
            .into_iter()
            .map(|h| h.join().map_err(|_| anyhow!("stress thread panicked"))?)
            .collect::<Result<Vec<_>>>()
    })?;
    let mut raw = [0u8; BLOCK_SZ];
    for blockno in 0..opts.blocks {
        let expect: u64 = per_thread.iter().map(|mine| mine[blockno]).sum();
        device.read_block(blockno, &mut raw)?;
        let mut counter = [0u8; 8];
        counter.copy_from_slice(&raw[..8]);
        let on_disk = u64::from_ne_bytes(counter);
        ensure!(
            on_disk == expect,
            "block {}: {} increments on disk, {} made",
            blockno,
            on_disk,
            expect
        );
    }
    info!(
        "{} threads x {} operations over {} blocks: no update lost",
        opts.threads, opts.iterations, opts.blocks
    );
    Ok(())
}

/// Map a file living in blocks `[start, start + DEMO_BLOCKS)`, change it
/// through the mapping and check the change reached the file.
fn mmap_demo(cache: &Arc<BlockCache>, start: usize) -> Result<()> {
    let frames = Arc::new(FrameAllocator::from_region(
        PhysRegion::new(DEMO_FRAMES),
        1,
        Arc::new(UniHart::new()),
    ));
    let extent = Extent {
        dev: 0,
        start,
        nblocks: DEMO_BLOCKS,
    };
    let inode = Arc::new(Inode::new(cache.clone(), extent, 0));
    inode.write_at(0, b"hello, mmap")?;
    let task = TaskControlBlock::new(1, &frames)?;
    {
        let mut inner = task.inner_exclusive_access();
        let file = Arc::new(OSInode::new(true, true, inode.clone()));
        let base = inner.memory_set.mmap(
            0,
            PAGE_SIZE,
            MapProt::READ | MapProt::WRITE,
            MapFlags::SHARED,
            file,
            0,
        )?;
        let mut buf = [0u8; 11];
        inner.memory_set.user_load(base, &mut buf)?;
        ensure!(&buf == b"hello, mmap", "mapped {:?}", buf);
        inner.memory_set.user_store(base, b"HELLO")?;
        inner.memory_set.munmap(base, PAGE_SIZE)?;
    }
    let file = OSInode::new(true, false, inode);
    let back = file.read_all()?;
    ensure!(back == b"HELLO, mmap", "file holds {:?} after munmap", back);
    task.exit(0);
    info!("mmap write-back ok, {} frames free", frames.free_frames());
    Ok(())
}

#[test]
fn bcache_test() -> Result<()> {
    let opts = Options {
        image: std::env::temp_dir().join("bcache_test.img"),
        blocks: 64,
        threads: 4,
        iterations: 500,
        seed: 7,
        nbuf: 30,
        nbuckets: 13,
    };
    let stats = run(&opts)?;
    assert!(stats.hits > 0);
    assert!(stats.misses >= opts.nbuf);
    assert!(stats.evictions > 0);
    Ok(())
}
