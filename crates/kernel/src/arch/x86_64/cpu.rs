//! CPU feature detection and privileged register helpers

/// Read a model-specific register.
///
/// # Safety
///
/// The MSR must exist on this CPU; reading an unimplemented MSR raises #GP.
#[inline]
pub unsafe fn rdmsr(msr: u32) -> u64 {
    x86_64::registers::model_specific::Msr::new(msr).read()
}

/// Write a model-specific register.
///
/// # Safety
///
/// Writing a bad value to a live MSR can halt or corrupt the machine.
#[inline]
pub unsafe fn wrmsr(msr: u32, value: u64) {
    x86_64::registers::model_specific::Msr::new(msr).write(value)
}

/// Does the CPU expose a local APIC?
pub fn has_apic() -> bool {
    raw_cpuid::CpuId::new()
        .get_feature_info()
        .map(|f| f.has_apic())
        .unwrap_or(false)
}

/// Does the CPU support x2APIC (MSR-based) mode?
pub fn has_x2apic() -> bool {
    raw_cpuid::CpuId::new()
        .get_feature_info()
        .map(|f| f.has_x2apic())
        .unwrap_or(false)
}

/// CPU vendor string for the boot banner.
pub fn vendor() -> &'static str {
    // raw_cpuid returns an owned string; the banner only needs a coarse
    // answer, so classify instead of allocating.
    match raw_cpuid::CpuId::new().get_vendor_info() {
        Some(v) if v.as_str() == "GenuineIntel" => "Intel",
        Some(v) if v.as_str() == "AuthenticAMD" => "AMD",
        Some(_) => "unknown vendor",
        None => "no CPUID",
    }
}
