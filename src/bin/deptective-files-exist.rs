//! Embedded helper: given a list of paths as argv, prints the ones that don't exist
//! inside this image, one per line. Invoked as
//! `docker run --rm --entrypoint /usr/bin/deptective-files-exist <image> <path...>`
//! against a committed snapshot, so the check runs with that snapshot's own filesystem.

use std::ffi::CString;

fn exists(path: &str) -> bool {
    let Ok(c_path) = CString::new(path) else {
        return true;
    };
    let mut stat_buf: libc::stat = unsafe { std::mem::zeroed() };
    unsafe { libc::lstat(c_path.as_ptr(), &mut stat_buf) == 0 }
}

fn main() {
    for path in std::env::args().skip(1) {
        if !exists(&path) {
            println!("{path}");
        }
    }
}
