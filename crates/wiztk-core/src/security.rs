//! Process-hardening helpers: locked+zeroized secret buffers, constant-time
//! comparison, core-dump suppression, and restrictive file permissions.

use crate::error::{Result, ToolkitError};
use std::ptr;

/// A heap buffer that is `mlock`ed (best-effort) and zeroized on drop.
/// Used to hold derived keys and passphrase material for the lifetime of a
/// pipeline invocation.
pub struct SecureMemory {
    ptr: *mut u8,
    len: usize,
    locked: bool,
}

impl SecureMemory {
    pub fn new(size: usize) -> Result<Self> {
        let layout = std::alloc::Layout::from_size_align(size.max(1), 1)
            .map_err(|_| ToolkitError::resource("invalid secure memory layout"))?;

        let ptr = unsafe { std::alloc::alloc_zeroed(layout) };
        if ptr.is_null() {
            return Err(ToolkitError::resource("failed to allocate secure memory"));
        }

        let mut mem = SecureMemory {
            ptr,
            len: size,
            locked: false,
        };
        mem.lock().ok();
        Ok(mem)
    }

    pub fn lock(&mut self) -> Result<()> {
        if self.locked {
            return Ok(());
        }
        #[cfg(unix)]
        {
            let result = unsafe { libc::mlock(self.ptr as *const libc::c_void, self.len) };
            if result == 0 {
                self.locked = true;
            }
        }
        Ok(())
    }

    fn unlock(&mut self) {
        if self.locked {
            #[cfg(unix)]
            unsafe {
                libc::munlock(self.ptr as *const libc::c_void, self.len);
            }
            self.locked = false;
        }
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.ptr, self.len) }
    }

    pub fn as_slice(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.ptr, self.len) }
    }

    /// Copies `bytes` into a freshly allocated secure buffer. Callers should
    /// zeroize their own copy once this returns.
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        let mut mem = Self::new(bytes.len())?;
        mem.as_mut_slice().copy_from_slice(bytes);
        Ok(mem)
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl Drop for SecureMemory {
    fn drop(&mut self) {
        unsafe {
            ptr::write_bytes(self.ptr, 0, self.len);
        }
        self.unlock();
        if let Ok(layout) = std::alloc::Layout::from_size_align(self.len.max(1), 1) {
            unsafe { std::alloc::dealloc(self.ptr, layout) };
        }
    }
}

unsafe impl Send for SecureMemory {}
unsafe impl Sync for SecureMemory {}

/// Constant-time byte-string comparison, used for HMAC tag and header-digest
/// checks so a timing side channel never leaks how many leading bytes match.
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    use subtle::ConstantTimeEq;
    if a.len() != b.len() {
        return false;
    }
    a.ct_eq(b).into()
}

/// Best-effort: disable core dumps so a crash mid-pipeline cannot leak key
/// material or plaintext via a core file.
pub fn disable_core_dumps() {
    #[cfg(unix)]
    {
        use libc::{rlimit, setrlimit, RLIMIT_CORE};
        let rlim = rlimit {
            rlim_cur: 0,
            rlim_max: 0,
        };
        unsafe {
            setrlimit(RLIMIT_CORE, &rlim);
        }
    }
}

/// Restrict a file (keyring, reservoir, signer key) to owner read/write.
pub fn set_secure_permissions(path: &std::path::Path) -> Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o600);
        std::fs::set_permissions(path, perms)?;
    }
    #[cfg(not(unix))]
    {
        let mut perms = std::fs::metadata(path)?.permissions();
        perms.set_readonly(false);
        std::fs::set_permissions(path, perms)?;
    }
    Ok(())
}
