use std::fs;
use std::path::{Path, PathBuf};

use crate::builder::SysBuilder;

/// Shared elaboration configuration for both backends.
pub struct Config {
  /// The directory under which generated projects are dumped.
  pub base_dir: PathBuf,
  /// If true, an existing dump directory is wiped before writing.
  pub override_dump: bool,
  /// The number of cycles to simulate.
  pub sim_threshold: usize,
  /// The number of consecutive idle cycles (no module fired) before the run stops.
  pub idle_threshold: usize,
  /// The base directory of memory initialization files.
  pub resource_base: PathBuf,
  /// The FIFO depth (log2) used when no per-binding hint is given.
  pub default_fifo_depth: usize,
  /// Shuffle the sequential-module evaluation order each cycle.
  pub random: bool,
  /// The path the generated simulator manifest uses for its `sim-runtime` dependency.
  pub runtime_path: PathBuf,
}

impl Default for Config {
  fn default() -> Self {
    Config {
      base_dir: std::env::temp_dir(),
      override_dump: true,
      sim_threshold: 100,
      idle_threshold: 100,
      resource_base: PathBuf::new(),
      default_fifo_depth: 2,
      random: false,
      runtime_path: PathBuf::from("tools/rust-sim-runtime"),
    }
  }
}

impl Config {
  /// The directory the given flavor of output is dumped to.
  pub fn dir_name(&self, sys: &SysBuilder, suffix: &str) -> PathBuf {
    self.base_dir.join(format!("{}_{}", sys.get_name(), suffix))
  }
}

/// Create the directory (wiping it when overriding is allowed).
pub(super) fn create_and_clean_dir(dir: &Path, override_dir: bool) -> std::io::Result<()> {
  if dir.exists() {
    if override_dir {
      fs::remove_dir_all(dir)?;
    } else {
      assert!(
        fs::read_dir(dir)?.next().is_none(),
        "{} already exists and is not empty",
        dir.display()
      );
    }
  }
  fs::create_dir_all(dir)
}

/// Parse a memory image: one hex value per line, `//` comments, `_` separators, and
/// `@addr` markers. Malformed lines are skipped with a warning instead of aborting;
/// they only affect initial memory contents, never IR correctness.
pub fn read_init_file(path: &Path, depth: usize) -> std::io::Result<Vec<u64>> {
  let mut res = vec![0u64; depth];
  let mut idx = 0;
  for (lineno, line) in fs::read_to_string(path)?.lines().enumerate() {
    let line = match line.find("//") {
      Some(strip) => line[..strip].trim(),
      None => line.trim(),
    };
    if line.is_empty() {
      continue;
    }
    let line = line.replace('_', "");
    if let Some(addr) = line.strip_prefix('@') {
      match usize::from_str_radix(addr, 16) {
        Ok(addr) => idx = addr,
        Err(_) => log::warn!(
          "{}:{}: malformed address line {:?}, skipped",
          path.display(),
          lineno + 1,
          line
        ),
      }
      continue;
    }
    match u64::from_str_radix(&line, 16) {
      Ok(value) if idx < depth => {
        res[idx] = value;
        idx += 1;
      }
      Ok(_) => {
        log::warn!(
          "{}:{}: address {} beyond the memory depth {}, skipped",
          path.display(),
          lineno + 1,
          idx,
          depth
        );
        idx += 1;
      }
      Err(_) => {
        log::warn!(
          "{}:{}: malformed hex line {:?}, skipped",
          path.display(),
          lineno + 1,
          line
        );
      }
    }
  }
  Ok(res)
}
