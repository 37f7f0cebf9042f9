//! Thin dlopen/dlsym wrapper over libc, plus mapped-segment lookup for a
//! loaded object.

use anyhow::{Context, Result, anyhow};
use std::ffi::{CStr, CString, c_void};
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};
use tracing::debug;
use xrdp_local_core::probe::ModuleImage;

/// Most recent dlerror() text.
fn last_error() -> String {
    // SAFETY: dlerror returns null or a thread-local C string.
    unsafe {
        let msg = libc::dlerror();
        if msg.is_null() {
            "unknown error".into()
        } else {
            CStr::from_ptr(msg).to_string_lossy().into_owned()
        }
    }
}

/// An open shared object; closed on drop.
pub struct Library {
    handle: *mut c_void,
    path: PathBuf,
}

impl Library {
    pub fn open(path: &Path) -> Result<Self> {
        let c_path = CString::new(path.as_os_str().as_bytes())
            .with_context(|| format!("Library path {:?} contains a NUL byte", path))?;
        // SAFETY: valid C string; RTLD_NOW surfaces missing symbols here.
        let handle = unsafe { libc::dlopen(c_path.as_ptr(), libc::RTLD_NOW | libc::RTLD_LOCAL) };
        if handle.is_null() {
            return Err(anyhow!("dlopen {:?} failed: {}", path, last_error()));
        }
        debug!("Loaded {:?}", path);
        Ok(Self {
            handle,
            path: path.to_path_buf(),
        })
    }

    /// Look up `name` as a value of type `T` (a function pointer).
    ///
    /// # Safety
    /// `T` must be pointer-sized and match the symbol's real type.
    pub unsafe fn symbol<T: Copy>(&self, name: &str) -> Result<T> {
        anyhow::ensure!(
            std::mem::size_of::<T>() == std::mem::size_of::<*mut c_void>(),
            "{} requested as a non-pointer type",
            name
        );
        let c_name = CString::new(name)?;
        // SAFETY: handle is live for &self.
        let ptr = unsafe { libc::dlsym(self.handle, c_name.as_ptr()) };
        if ptr.is_null() {
            return Err(anyhow!("{} not found in {:?}: {}", name, self.path, last_error()));
        }
        // SAFETY: caller guarantees T is the symbol's pointer type.
        Ok(unsafe { std::mem::transmute_copy::<*mut c_void, T>(&ptr) })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for Library {
    fn drop(&mut self) {
        // SAFETY: handle came from dlopen and is closed once.
        if unsafe { libc::dlclose(self.handle) } != 0 {
            tracing::warn!("dlclose {:?} failed: {}", self.path, last_error());
        } else {
            debug!("Unloaded {:?}", self.path);
        }
    }
}

struct SegmentSearch {
    anchor: usize,
    segments: Vec<std::ops::Range<usize>>,
}

unsafe extern "C" fn collect_segments(
    info: *mut libc::dl_phdr_info,
    _size: libc::size_t,
    data: *mut c_void,
) -> libc::c_int {
    // SAFETY: dl_iterate_phdr passes a valid info and our own data pointer.
    let (info, search) = unsafe { (&*info, &mut *(data as *mut SegmentSearch)) };
    let base = info.dlpi_addr as usize;

    let mut loads = Vec::new();
    for i in 0..info.dlpi_phnum as usize {
        // SAFETY: dlpi_phdr has dlpi_phnum entries.
        let phdr = unsafe { &*info.dlpi_phdr.add(i) };
        if phdr.p_type == libc::PT_LOAD {
            let start = base + phdr.p_vaddr as usize;
            loads.push(start..start + phdr.p_memsz as usize);
        }
    }

    if loads.iter().any(|r| r.contains(&search.anchor)) {
        search.segments = loads;
        1
    } else {
        0
    }
}

/// Mapped PT_LOAD segments of the loaded object that contains `anchor`.
pub fn image_containing(anchor: *const c_void) -> ModuleImage {
    let mut search = SegmentSearch {
        anchor: anchor as usize,
        segments: Vec::new(),
    };
    // SAFETY: the callback only touches `search` for the duration of the call.
    unsafe {
        libc::dl_iterate_phdr(
            Some(collect_segments),
            &mut search as *mut SegmentSearch as *mut c_void,
        );
    }
    ModuleImage::new(search.segments)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_own_code_lies_in_own_image() {
        let anchor = image_containing as *const c_void;
        let image = image_containing(anchor);
        assert!(!image.is_empty());
        assert!(image.contains(anchor as usize));
        assert!(!image.contains(0));
    }

    #[test]
    fn test_missing_library_reports_path() {
        let err = Library::open(Path::new("/nonexistent/libnothing.so"))
            .err()
            .map(|e| e.to_string())
            .unwrap_or_default();
        assert!(err.contains("libnothing.so"));
    }
}
