#[cfg(unix)]
pub mod _unix {
    use std::ptr::null_mut;

    /// A reserved anonymous mapping. Pages are committed lazily by the kernel
    /// on first touch, so reserving a multi-GiB region is cheap until used.
    pub struct Mmap {
        start: *mut u8,
        size: usize,
    }

    impl Mmap {
        pub fn new(size: usize) -> Self {
            unsafe {
                let map = libc::mmap(
                    null_mut(),
                    size as _,
                    libc::PROT_READ | libc::PROT_WRITE,
                    libc::MAP_PRIVATE | libc::MAP_ANON,
                    -1,
                    0,
                );
                if map == libc::MAP_FAILED {
                    panic!("mmap failed");
                }
                Self {
                    start: map as *mut u8,
                    size,
                }
            }
        }

        pub fn start(&self) -> *mut u8 {
            self.start
        }
    }

    impl Drop for Mmap {
        fn drop(&mut self) {
            unsafe {
                libc::munmap(self.start as *mut _, self.size as _);
            }
        }
    }
}

#[cfg(windows)]
pub mod _win {
    use core::ptr::null_mut;
    use winapi::um::{
        memoryapi::{VirtualAlloc, VirtualFree},
        winnt::{MEM_COMMIT, MEM_RELEASE, MEM_RESERVE, PAGE_READWRITE},
    };

    pub struct Mmap {
        start: *mut u8,
        size: usize,
    }

    impl Mmap {
        pub fn new(size: usize) -> Self {
            unsafe {
                let mem = VirtualAlloc(null_mut(), size, MEM_RESERVE | MEM_COMMIT, PAGE_READWRITE);
                if mem.is_null() {
                    panic!("VirtualAlloc failed");
                }
                Self {
                    start: mem as *mut u8,
                    size,
                }
            }
        }

        pub fn start(&self) -> *mut u8 {
            self.start
        }
    }

    impl Drop for Mmap {
        fn drop(&mut self) {
            unsafe {
                VirtualFree(self.start.cast(), 0, MEM_RELEASE);
            }
        }
    }
}

#[cfg(unix)]
pub use _unix::*;
#[cfg(windows)]
pub use _win::*;

unsafe impl Send for Mmap {}
unsafe impl Sync for Mmap {}
