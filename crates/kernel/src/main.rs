//! Kernel binary shell
//!
//! All kernel code lives in the library crate; the boot stub in
//! `arch::x86_64::boot` provides `_start` and calls into `init`. On a
//! hosted build this binary is an empty stub so the workspace still
//! builds (and `cargo test` runs the library's unit tests).

#![cfg_attr(target_os = "none", no_std)]
#![cfg_attr(target_os = "none", no_main)]

#[cfg(target_os = "none")]
#[allow(unused_imports)]
use kestrel_kernel as _;

#[cfg(not(target_os = "none"))]
fn main() {
    eprintln!("kestrel is a kernel image; boot it via GRUB (Multiboot2).");
    eprintln!("Build with: cargo build --target crates/kernel/x86_64-kestrel.json -Zbuild-std=core,alloc");
}
