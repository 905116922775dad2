/// Executable code buffer.
/// A page-aligned region that starts writable, is sealed to
/// read+execute exactly once, and is unmapped on drop. Nothing
/// platform-specific escapes this module: callers see `allocate`,
/// `write`, `make_executable`, `entry` and `free`.

use std::io;

pub struct CodeBuffer {
    ptr: *mut u8,
    len: usize,
    used: usize,
    executable: bool,
}

// The region is only written before `make_executable` and only read
// or executed afterwards.
unsafe impl Send for CodeBuffer {}
unsafe impl Sync for CodeBuffer {}

impl CodeBuffer {
    /// Map a writable region of at least `size` bytes.
    pub fn allocate(size: usize) -> io::Result<CodeBuffer> {
        let len = round_up_to_page(size.max(1));
        let ptr = platform::map_rw(len)?;
        Ok(CodeBuffer { ptr, len, used: 0, executable: false })
    }

    /// Append bytes. Fails once the buffer has been sealed or when the
    /// region is full.
    pub fn write(&mut self, bytes: &[u8]) -> io::Result<()> {
        if self.executable {
            return Err(io::Error::new(
                io::ErrorKind::PermissionDenied,
                "code buffer is already executable",
            ));
        }
        if self.used + bytes.len() > self.len {
            return Err(io::Error::new(
                io::ErrorKind::OutOfMemory,
                "code buffer overflow",
            ));
        }
        unsafe {
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), self.ptr.add(self.used), bytes.len());
        }
        self.used += bytes.len();
        Ok(())
    }

    /// Patch previously written bytes in place; used for jump fixups.
    pub fn patch(&mut self, offset: usize, bytes: &[u8]) -> io::Result<()> {
        if self.executable {
            return Err(io::Error::new(
                io::ErrorKind::PermissionDenied,
                "code buffer is already executable",
            ));
        }
        if offset + bytes.len() > self.used {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "patch outside written region",
            ));
        }
        unsafe {
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), self.ptr.add(offset), bytes.len());
        }
        Ok(())
    }

    /// Seal the region: writable becomes read+execute.
    pub fn make_executable(&mut self) -> io::Result<()> {
        if !self.executable {
            platform::protect_rx(self.ptr, self.len)?;
            self.executable = true;
        }
        Ok(())
    }

    pub fn entry(&self) -> *const u8 {
        self.ptr
    }

    pub fn is_executable(&self) -> bool {
        self.executable
    }

    pub fn len(&self) -> usize {
        self.used
    }

    pub fn is_empty(&self) -> bool {
        self.used == 0
    }

    /// Release the mapping. Equivalent to dropping the buffer.
    pub fn free(self) {}
}

impl Drop for CodeBuffer {
    fn drop(&mut self) {
        platform::unmap(self.ptr, self.len);
    }
}

fn round_up_to_page(size: usize) -> usize {
    let page = platform::page_size();
    (size + page - 1) & !(page - 1)
}

// ---------------------------------------------------------------------------
// Platform primitives
// ---------------------------------------------------------------------------

#[cfg(unix)]
mod platform {
    use std::io;

    pub fn page_size() -> usize {
        let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        if size <= 0 {
            4096
        } else {
            size as usize
        }
    }

    pub fn map_rw(len: usize) -> io::Result<*mut u8> {
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANON,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            Err(io::Error::last_os_error())
        } else {
            Ok(ptr as *mut u8)
        }
    }

    pub fn protect_rx(ptr: *mut u8, len: usize) -> io::Result<()> {
        let rc = unsafe {
            libc::mprotect(ptr as *mut libc::c_void, len, libc::PROT_READ | libc::PROT_EXEC)
        };
        if rc != 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(())
        }
    }

    pub fn unmap(ptr: *mut u8, len: usize) {
        unsafe {
            libc::munmap(ptr as *mut libc::c_void, len);
        }
    }
}

#[cfg(windows)]
mod platform {
    use std::ffi::c_void;
    use std::io;

    const MEM_COMMIT: u32 = 0x1000;
    const MEM_RESERVE: u32 = 0x2000;
    const MEM_RELEASE: u32 = 0x8000;
    const PAGE_READWRITE: u32 = 0x04;
    const PAGE_EXECUTE_READ: u32 = 0x20;

    #[link(name = "kernel32")]
    extern "system" {
        fn VirtualAlloc(
            lpaddress: *mut c_void,
            dwsize: usize,
            flallocationtype: u32,
            flprotect: u32,
        ) -> *mut c_void;
        fn VirtualProtect(
            lpaddress: *mut c_void,
            dwsize: usize,
            flnewprotect: u32,
            lpfloldprotect: *mut u32,
        ) -> i32;
        fn VirtualFree(lpaddress: *mut c_void, dwsize: usize, dwfreetype: u32) -> i32;
    }

    pub fn page_size() -> usize {
        4096
    }

    pub fn map_rw(len: usize) -> io::Result<*mut u8> {
        let ptr = unsafe {
            VirtualAlloc(std::ptr::null_mut(), len, MEM_COMMIT | MEM_RESERVE, PAGE_READWRITE)
        };
        if ptr.is_null() {
            Err(io::Error::last_os_error())
        } else {
            Ok(ptr as *mut u8)
        }
    }

    pub fn protect_rx(ptr: *mut u8, len: usize) -> io::Result<()> {
        let mut old = 0u32;
        let rc = unsafe { VirtualProtect(ptr as *mut c_void, len, PAGE_EXECUTE_READ, &mut old) };
        if rc == 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(())
        }
    }

    pub fn unmap(ptr: *mut u8, len: usize) {
        unsafe {
            VirtualFree(ptr as *mut c_void, len, MEM_RELEASE);
        }
    }
}
