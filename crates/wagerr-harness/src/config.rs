//! Runner options, datadir layout, and deterministic port assignment.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use clap::Parser;

/// Maximum nodes a single run may use; also the size of the cached premine.
pub const MAX_NODES: usize = 12;

const PORT_MIN: u16 = 11000;
const PORT_RANGE: u16 = 5000;

pub const RPC_USER: &str = "rt";
pub const RPC_PASSWORD: &str = "rt";

/// Regtest genesis block timestamp.
pub const GENESIS_TIME: i64 = 1_524_496_462;
/// Block spacing used when replaying the cached premine's timestamps.
pub const CACHE_BLOCK_SPACING: i64 = 156;
/// Height of the cached premine chain.
pub const CACHE_CHAIN_HEIGHT: u64 = 200;

/// Datadir subtrees that survive cache pruning; everything else in the
/// chain folder is scratch and gets deleted before the cache is reused.
pub const PERSISTED_SUBDIRS: &[&str] = &[
    "wallets",
    "chainstate",
    "blocks",
    "evodb",
    "llmq",
    "backups",
    "tokens",
    "zerocoin",
];

/// Files never copied between datadirs (locks, pids, live logs).
const TRANSIENT_FILES: &[&str] = &[".lock", ".cookie", "wagerrd.pid", "debug.log"];

/// Command-line options shared by every scenario binary.
#[derive(Debug, Clone, Parser)]
#[command(about = "Wagerr functional-test harness", long_about = None)]
pub struct HarnessOptions {
    /// Path to the wagerrd binary (defaults to $WAGERRD, then PATH lookup).
    #[arg(long)]
    pub daemon: Option<PathBuf>,

    /// Leave daemons and datadirs behind on exit or error.
    #[arg(long)]
    pub nocleanup: bool,

    /// Don't stop the daemons after the test execution.
    #[arg(long)]
    pub noshutdown: bool,

    /// Root directory for datadirs (default: a fresh temp dir).
    #[arg(long)]
    pub tmpdir: Option<PathBuf>,

    /// Directory holding the pregenerated datadir cache.
    #[arg(long, default_value = "cache")]
    pub cachedir: PathBuf,

    /// Console log level (trace, debug, info, warn, error).
    #[arg(long, default_value = "info")]
    pub log_level: String,

    /// Seed for port assignment; distinct seeds let concurrent runs coexist.
    #[arg(long, default_value_t = std::process::id())]
    pub port_seed: u32,

    /// Multiply every timeout and polling interval; must be >= 1.
    #[arg(long, default_value_t = 1)]
    pub timeout_scale: u32,

    /// Extra argument passed to every daemon instance (repeatable).
    #[arg(long = "daemon-arg")]
    pub daemon_args: Vec<String>,
}

impl HarnessOptions {
    /// Resolve the daemon binary: `--daemon`, then `$WAGERRD`, then PATH.
    pub fn daemon_binary(&self) -> PathBuf {
        if let Some(path) = &self.daemon {
            return path.clone();
        }
        std::env::var_os("WAGERRD")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("wagerrd"))
    }
}

fn port_offset(seed: u32) -> u16 {
    let span = (PORT_RANGE as u32) - 2 * MAX_NODES as u32;
    (seed.wrapping_mul(37) % span) as u16
}

/// P2P listen port for node `index` under `seed`.
pub fn p2p_port(index: usize, seed: u32) -> u16 {
    PORT_MIN + port_offset(seed) + index as u16
}

/// RPC listen port for node `index` under `seed`.
pub fn rpc_port(index: usize, seed: u32) -> u16 {
    PORT_MIN + PORT_RANGE + port_offset(seed) + index as u16
}

/// Datadir root for node `index` under `root`.
pub fn node_datadir(root: &Path, index: usize) -> PathBuf {
    root.join(format!("node{index}"))
}

/// The chain subfolder inside a datadir.
pub fn chain_dir(datadir: &Path) -> PathBuf {
    datadir.join("regtest")
}

/// Create node `index`'s datadir and write its `wagerr.conf`. Rewrites the
/// conf when the datadir already exists, which is how copied datadirs get
/// their ports fixed up.
pub fn initialize_datadir(root: &Path, index: usize, seed: u32) -> io::Result<PathBuf> {
    let datadir = node_datadir(root, index);
    fs::create_dir_all(chain_dir(&datadir))?;
    let conf = format!(
        "regtest=1\n\
         port={}\n\
         rpcport={}\n\
         rpcuser={}\n\
         rpcpassword={}\n\
         server=1\n\
         listen=1\n\
         listenonion=0\n\
         discover=0\n\
         bind=127.0.0.1\n\
         keypool=1\n",
        p2p_port(index, seed),
        rpc_port(index, seed),
        RPC_USER,
        RPC_PASSWORD,
    );
    fs::write(datadir.join("wagerr.conf"), conf)?;
    Ok(datadir)
}

/// Chain-state subtrees cloned when seeding a masternode datadir from the
/// faucet node. Wallets deliberately stay behind.
const CHAIN_STATE_SUBDIRS: &[&str] = &["blocks", "chainstate", "evodb", "llmq"];

/// Seed node `to`'s datadir with node `from`'s chain state (blocks, UTXO
/// set, deterministic masternode list, quorum db) and write a fresh conf
/// for `to`'s ports. The source node must be stopped.
pub fn copy_datadir(root: &Path, from: usize, to: usize, seed: u32) -> io::Result<()> {
    let src = chain_dir(&node_datadir(root, from));
    let datadir = initialize_datadir(root, to, seed)?;
    for sub in CHAIN_STATE_SUBDIRS {
        let from_dir = src.join(sub);
        if from_dir.is_dir() {
            copy_tree(&from_dir, &chain_dir(&datadir).join(sub))?;
        }
    }
    Ok(())
}

/// Copy `from`'s datadir across roots (cache dir to test dir).
pub fn copy_datadir_across(
    from_root: &Path,
    to_root: &Path,
    index: usize,
    seed: u32,
) -> io::Result<()> {
    let src = chain_dir(&node_datadir(from_root, index));
    let datadir = initialize_datadir(to_root, index, seed)?;
    copy_tree(&src, &chain_dir(&datadir))
}

/// Delete everything in a cached datadir's chain folder that is not part of
/// the persisted chain state.
pub fn prune_cache_datadir(root: &Path, index: usize) -> io::Result<()> {
    let chain = chain_dir(&node_datadir(root, index));
    for entry in fs::read_dir(&chain)? {
        let entry = entry?;
        let name = entry.file_name();
        let keep = PERSISTED_SUBDIRS
            .iter()
            .any(|p| name.to_string_lossy() == *p);
        if keep {
            continue;
        }
        let path = entry.path();
        if entry.file_type()?.is_dir() {
            fs::remove_dir_all(path)?;
        } else {
            fs::remove_file(path)?;
        }
    }
    Ok(())
}

fn copy_tree(src: &Path, dst: &Path) -> io::Result<()> {
    fs::create_dir_all(dst)?;
    for entry in fs::read_dir(src)? {
        let entry = entry?;
        let name = entry.file_name();
        if TRANSIENT_FILES
            .iter()
            .any(|t| name.to_string_lossy() == *t)
        {
            continue;
        }
        let from = entry.path();
        let to = dst.join(&name);
        if entry.file_type()?.is_dir() {
            copy_tree(&from, &to)?;
        } else {
            fs::copy(&from, &to)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ports_are_deterministic_and_disjoint() {
        let seed = 4242;
        assert_eq!(p2p_port(0, seed), p2p_port(0, seed));
        let mut all = Vec::new();
        for i in 0..MAX_NODES {
            all.push(p2p_port(i, seed));
            all.push(rpc_port(i, seed));
        }
        let unique: std::collections::BTreeSet<_> = all.iter().copied().collect();
        assert_eq!(unique.len(), all.len(), "port collision: {all:?}");
    }

    #[test]
    fn port_offset_stays_in_range() {
        for seed in [0u32, 1, 999, u32::MAX] {
            let p = p2p_port(MAX_NODES - 1, seed);
            let r = rpc_port(MAX_NODES - 1, seed);
            assert!(p >= PORT_MIN && p < PORT_MIN + PORT_RANGE);
            assert!(r >= PORT_MIN + PORT_RANGE && r < PORT_MIN + 2 * PORT_RANGE);
        }
    }

    #[test]
    fn initialize_writes_conf_with_ports() {
        let tmp = tempfile::tempdir().unwrap();
        let datadir = initialize_datadir(tmp.path(), 3, 7).unwrap();
        let conf = std::fs::read_to_string(datadir.join("wagerr.conf")).unwrap();
        assert!(conf.contains("regtest=1"));
        assert!(conf.contains(&format!("port={}", p2p_port(3, 7))));
        assert!(conf.contains(&format!("rpcport={}", rpc_port(3, 7))));
        assert!(chain_dir(&datadir).is_dir());
    }

    #[test]
    fn copy_datadir_clones_chain_state_only() {
        let tmp = tempfile::tempdir().unwrap();
        let src = initialize_datadir(tmp.path(), 0, 7).unwrap();
        let blocks = chain_dir(&src).join("blocks");
        std::fs::create_dir_all(&blocks).unwrap();
        std::fs::write(blocks.join("blk00000.dat"), b"blockdata").unwrap();
        std::fs::create_dir_all(chain_dir(&src).join("wallets")).unwrap();
        std::fs::write(chain_dir(&src).join("wallets/wallet.dat"), b"keys").unwrap();
        std::fs::write(chain_dir(&src).join("debug.log"), b"noise").unwrap();

        copy_datadir(tmp.path(), 0, 5, 7).unwrap();

        let dst = node_datadir(tmp.path(), 5);
        assert_eq!(
            std::fs::read(chain_dir(&dst).join("blocks/blk00000.dat")).unwrap(),
            b"blockdata"
        );
        // wallets and transient files stay behind
        assert!(!chain_dir(&dst).join("wallets").exists());
        assert!(!chain_dir(&dst).join("debug.log").exists());
        let conf = std::fs::read_to_string(dst.join("wagerr.conf")).unwrap();
        assert!(conf.contains(&format!("rpcport={}", rpc_port(5, 7))));
    }

    #[test]
    fn copy_datadir_across_roots_clones_everything() {
        let cache = tempfile::tempdir().unwrap();
        let run = tempfile::tempdir().unwrap();
        let src = initialize_datadir(cache.path(), 2, 7).unwrap();
        std::fs::create_dir_all(chain_dir(&src).join("wallets")).unwrap();
        std::fs::write(chain_dir(&src).join("wallets/wallet.dat"), b"keys").unwrap();

        copy_datadir_across(cache.path(), run.path(), 2, 9).unwrap();

        let dst = node_datadir(run.path(), 2);
        assert_eq!(
            std::fs::read(chain_dir(&dst).join("wallets/wallet.dat")).unwrap(),
            b"keys"
        );
        let conf = std::fs::read_to_string(dst.join("wagerr.conf")).unwrap();
        assert!(conf.contains(&format!("rpcport={}", rpc_port(2, 9))));
    }

    #[test]
    fn prune_keeps_only_persisted_subtrees() {
        let tmp = tempfile::tempdir().unwrap();
        let datadir = initialize_datadir(tmp.path(), 0, 7).unwrap();
        let chain = chain_dir(&datadir);
        for dir in ["chainstate", "evodb", "banlist"] {
            std::fs::create_dir_all(chain.join(dir)).unwrap();
        }
        std::fs::write(chain.join("peers.dat"), b"x").unwrap();

        prune_cache_datadir(tmp.path(), 0).unwrap();

        assert!(chain.join("chainstate").exists());
        assert!(chain.join("evodb").exists());
        assert!(!chain.join("banlist").exists());
        assert!(!chain.join("peers.dat").exists());
    }
}
