#[cfg(all(target_os = "windows", target_arch = "x86_64"))]
mod win32;
#[cfg(all(target_os = "windows", target_arch = "x86_64"))]
pub use self::win32::*;
