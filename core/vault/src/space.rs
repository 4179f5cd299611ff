//! Free-space checks before writing new blobs.

use std::path::Path;

use satchel_common::{Error, Result};

/// Reports free space on the device holding a path.
pub trait SpaceProbe: Send + Sync {
    fn available_space(&self, path: &Path) -> Result<u64>;
}

/// Asks the operating system.
#[derive(Debug, Clone, Copy, Default)]
pub struct FsSpaceProbe;

impl SpaceProbe for FsSpaceProbe {
    fn available_space(&self, path: &Path) -> Result<u64> {
        Ok(fs2::available_space(path)?)
    }
}

/// Fail with `InsufficientSpace` unless writing `file_size` bytes still
/// leaves `headroom` free once the working index is written back too.
pub fn ensure_space(
    probe: &dyn SpaceProbe,
    vault_root: &Path,
    working_index_size: u64,
    file_size: u64,
    headroom: u64,
) -> Result<()> {
    let available = probe.available_space(vault_root)?;
    let needed = working_index_size
        .saturating_add(file_size)
        .saturating_add(headroom);
    if available < needed {
        return Err(Error::InsufficientSpace { needed, available });
    }
    Ok(())
}
