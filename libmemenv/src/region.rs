use bytesize::ByteSize;
use off64::usz;
use std::fs;
use std::fs::File;
use std::fs::OpenOptions;
use std::io;
use std::os::unix::io::AsRawFd;
use std::path::Path;
use std::path::PathBuf;
use std::ptr;
use std::ptr::NonNull;
use tracing::debug;
use tracing::info;
use tracing::warn;

/*

# Regions

A region is one contiguous mapping, pre-faulted at reservation time so that the cost of making it usable is paid up front and shows up in startup latency.

- Anonymous regions are private to the process. The kernel reclaims them when the process dies, so they can never be attached to again.
- File-backed regions are shared mappings of a file, normally on a hugetlbfs mount. The file outlives the process, so a later process can map the same physical pages again.

Dropping a region only unmaps it. Only `release` deletes the backing file; a process that dies without calling it leaves the file for the next process to attach to.

*/

#[derive(Clone, PartialEq, Eq, Debug)]
pub enum RegionBacking {
  Anonymous,
  File(PathBuf),
}

pub struct Region {
  base: NonNull<u8>,
  len: u64,
  backing: RegionBacking,
  reclaimed: bool,
}

// The region is only a range of memory; nothing in it is tied to the reserving thread.
unsafe impl Send for Region {}
unsafe impl Sync for Region {}

fn map(len: u64, prot: libc::c_int, flags: libc::c_int, fd: libc::c_int) -> io::Result<NonNull<u8>> {
  let addr = unsafe { libc::mmap(ptr::null_mut(), usz!(len), prot, flags, fd, 0) };
  if addr == libc::MAP_FAILED {
    return Err(io::Error::last_os_error());
  };
  Ok(NonNull::new(addr.cast()).expect("mmap returned null without MAP_FIXED"))
}

fn pin(base: NonNull<u8>, len: u64) {
  let rc = unsafe { libc::mlock(base.as_ptr() as *const libc::c_void, usz!(len)) };
  if rc != 0 {
    // Usually RLIMIT_MEMLOCK, which a default run hits. The region stays usable, just not pinned.
    info!(
      error = %io::Error::last_os_error(),
      size = %ByteSize(len),
      "failed to pin region",
    );
  };
}

#[cfg(target_os = "linux")]
const POPULATE: libc::c_int = libc::MAP_POPULATE;
#[cfg(not(target_os = "linux"))]
const POPULATE: libc::c_int = 0;

impl Region {
  pub fn reserve_anonymous(len: u64, hugepages: bool, pin_pages: bool) -> io::Result<Self> {
    assert!(len > 0);
    let prot = libc::PROT_READ | libc::PROT_WRITE;
    let flags = libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | POPULATE;

    #[cfg(target_os = "linux")]
    let base = if hugepages {
      match map(len, prot, flags | libc::MAP_HUGETLB, -1) {
        Ok(base) => base,
        Err(error) => {
          // The default huge page pool is often empty or too small.
          warn!(%error, "huge page reservation failed, falling back to normal pages");
          map(len, prot, flags, -1)?
        }
      }
    } else {
      map(len, prot, flags, -1)?
    };
    #[cfg(not(target_os = "linux"))]
    let base = {
      let _ = hugepages;
      map(len, prot, flags, -1)?
    };

    if pin_pages {
      pin(base, len);
    };
    info!(size = %ByteSize(len), "reserved anonymous region");
    Ok(Self {
      base,
      len,
      backing: RegionBacking::Anonymous,
      reclaimed: false,
    })
  }

  /// Attaches to the region backed by the file at `path`, creating the file if it doesn't exist yet.
  pub fn create_or_attach_file(path: &Path, len: u64, pin_pages: bool) -> io::Result<Self> {
    let file = OpenOptions::new()
      .read(true)
      .write(true)
      .create(true)
      .open(path)?;
    Self::map_file(file, path, len, pin_pages)
  }

  /// Fails with `NotFound` if there's no backing file to attach to.
  pub fn attach_file(path: &Path, len: u64, pin_pages: bool) -> io::Result<Self> {
    let file = OpenOptions::new().read(true).write(true).open(path)?;
    Self::map_file(file, path, len, pin_pages)
  }

  fn map_file(file: File, path: &Path, len: u64, pin_pages: bool) -> io::Result<Self> {
    assert!(len > 0);
    let existing_len = file.metadata()?.len();
    let reclaimed = match existing_len {
      0 => false,
      l if l == len => true,
      l => {
        return Err(io::Error::new(
          io::ErrorKind::InvalidData,
          format!(
            "existing region at {} has size {} but {} was requested",
            path.display(),
            ByteSize(l),
            ByteSize(len)
          ),
        ));
      }
    };

    // On hugetlbfs the size must be a multiple of the huge page size.
    let sized = if reclaimed { Ok(()) } else { file.set_len(len) };
    let mapped = sized.and_then(|()| {
      map(
        len,
        libc::PROT_READ | libc::PROT_WRITE,
        libc::MAP_SHARED | POPULATE,
        file.as_raw_fd(),
      )
    });
    let base = match mapped {
      Ok(base) => base,
      Err(err) => {
        // A file we sized but never mapped would later be mistaken for a surviving region.
        if !reclaimed {
          if let Err(error) = fs::remove_file(path) {
            warn!(%error, path = %path.display(), "failed to remove unmapped region backing file");
          };
        };
        return Err(err);
      }
    };
    // The mapping keeps its own reference to the file.
    drop(file);

    if pin_pages {
      pin(base, len);
    };
    info!(
      path = %path.display(),
      size = %ByteSize(len),
      reclaimed,
      "mapped file-backed region",
    );
    Ok(Self {
      base,
      len,
      backing: RegionBacking::File(path.to_path_buf()),
      reclaimed,
    })
  }

  pub fn len(&self) -> u64 {
    self.len
  }

  pub fn backing(&self) -> &RegionBacking {
    &self.backing
  }

  /// Whether this region was attached to an existing backing file rather than freshly reserved.
  pub fn reclaimed(&self) -> bool {
    self.reclaimed
  }

  #[cfg(test)]
  pub(crate) fn as_mut_slice(&mut self) -> &mut [u8] {
    unsafe { std::slice::from_raw_parts_mut(self.base.as_ptr(), usz!(self.len)) }
  }

  /// Unmaps the region and deletes its backing file, if any.
  pub fn release(mut self) -> io::Result<()> {
    self.unmap()?;
    if let RegionBacking::File(path) = &self.backing {
      fs::remove_file(path)?;
      debug!(path = %path.display(), "removed region backing file");
    };
    Ok(())
  }

  fn unmap(&mut self) -> io::Result<()> {
    if self.len == 0 {
      return Ok(());
    };
    let rc = unsafe { libc::munmap(self.base.as_ptr().cast(), usz!(self.len)) };
    if rc != 0 {
      return Err(io::Error::last_os_error());
    };
    self.len = 0;
    Ok(())
  }
}

impl Drop for Region {
  fn drop(&mut self) {
    if let Err(error) = self.unmap() {
      warn!(%error, "failed to unmap region");
    };
  }
}
