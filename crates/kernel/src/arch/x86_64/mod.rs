// x86_64 architecture support

pub mod acpi;
pub mod apic;
pub mod ata;
pub mod boot;
pub mod controller;
pub mod cpu;
pub mod gdt;
pub mod hpet;
pub mod idt;
pub mod ioapic;
pub mod paging;
pub mod pic;
pub mod pit;
pub mod rtc;
pub mod serial;
pub mod tss;
