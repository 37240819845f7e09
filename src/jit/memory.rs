//! Executable memory for compiled programs.
//!
//! Code is written into a fresh read-write mapping which is then flipped to
//! read-execute; the mapping is never writable and executable at the same
//! time.

use crate::error::{Error, Result};

/// An owned read+execute mapping holding one compiled program.
pub(crate) struct ExecutableMemory {
    ptr: *mut u8,
    len: usize,
}

impl ExecutableMemory {
    pub fn as_ptr(&self) -> *const u8 {
        self.ptr
    }
}

#[cfg(unix)]
impl ExecutableMemory {
    pub fn new(code: &[u8]) -> Result<ExecutableMemory> {
        let len = code.len().max(1);
        // Safety: a fresh anonymous private mapping; we are its only user
        // until it is unmapped in Drop.
        unsafe {
            let ptr = libc::mmap(
                core::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            );
            if ptr == libc::MAP_FAILED {
                return Err(Error::ResourceExhausted);
            }
            let ptr = ptr.cast::<u8>();
            core::ptr::copy_nonoverlapping(code.as_ptr(), ptr, code.len());
            if libc::mprotect(ptr.cast(), len, libc::PROT_READ | libc::PROT_EXEC) != 0 {
                libc::munmap(ptr.cast(), len);
                return Err(Error::TranslatorFault(
                    "could not make the compiled program executable".into(),
                ));
            }
            Ok(ExecutableMemory { ptr, len })
        }
    }
}

#[cfg(unix)]
impl Drop for ExecutableMemory {
    fn drop(&mut self) {
        // Safety: the mapping was created by new with this length.
        unsafe {
            libc::munmap(self.ptr.cast(), self.len);
        }
    }
}

#[cfg(windows)]
impl ExecutableMemory {
    pub fn new(code: &[u8]) -> Result<ExecutableMemory> {
        use windows_sys::Win32::System::Memory::{
            VirtualAlloc, VirtualProtect, MEM_COMMIT, MEM_RESERVE, PAGE_EXECUTE_READ,
            PAGE_READWRITE,
        };

        let len = code.len().max(1);
        // Safety: a fresh private allocation; we are its only user until
        // it is released in Drop.
        unsafe {
            let ptr = VirtualAlloc(
                core::ptr::null(),
                len,
                MEM_COMMIT | MEM_RESERVE,
                PAGE_READWRITE,
            );
            if ptr.is_null() {
                return Err(Error::ResourceExhausted);
            }
            let ptr = ptr.cast::<u8>();
            core::ptr::copy_nonoverlapping(code.as_ptr(), ptr, code.len());
            let mut old = 0;
            if VirtualProtect(ptr.cast(), len, PAGE_EXECUTE_READ, &mut old) == 0 {
                windows_sys::Win32::System::Memory::VirtualFree(
                    ptr.cast(),
                    0,
                    windows_sys::Win32::System::Memory::MEM_RELEASE,
                );
                return Err(Error::TranslatorFault(
                    "could not make the compiled program executable".into(),
                ));
            }
            Ok(ExecutableMemory { ptr, len })
        }
    }
}

#[cfg(windows)]
impl Drop for ExecutableMemory {
    fn drop(&mut self) {
        use windows_sys::Win32::System::Memory::{VirtualFree, MEM_RELEASE};
        // Safety: the allocation was created by new.
        unsafe {
            VirtualFree(self.ptr.cast(), 0, MEM_RELEASE);
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[test]
    fn round_trips_code_bytes() {
        let code = [0xc3u8; 16];
        let memory = ExecutableMemory::new(&code).unwrap();
        let installed = unsafe { core::slice::from_raw_parts(memory.as_ptr(), code.len()) };
        assert_eq!(installed, &code);
    }
}
