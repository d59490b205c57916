//! Compiled backends and host capability probing.
//!
//! Provides:
//! - [`Backend`] enum gated by cargo features (`cpu`)
//! - [`CpuFeature`] with runtime detection on x86_64 and aarch64
//! - [`system_info`] — the `NAME = 0|1 | ...` capability line

use std::fmt;

/// Compute backend for inference.
///
/// Variants are compile-time gated by cargo features.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Backend {
    #[cfg(feature = "cpu")]
    Cpu,
}

impl Backend {
    /// All backends enabled at compile time.
    pub fn compiled() -> &'static [Backend] {
        &[
            #[cfg(feature = "cpu")]
            Backend::Cpu,
        ]
    }

    /// First compiled backend.
    pub fn auto() -> Result<Backend, BackendError> {
        Self::compiled()
            .first()
            .copied()
            .ok_or(BackendError::NoBackendsCompiled)
    }
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            #[cfg(feature = "cpu")]
            Backend::Cpu => write!(f, "CPU"),
        }
    }
}

/// CPU instruction-set extensions relevant to inference kernels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CpuFeature {
    Sse3,
    Ssse3,
    Avx,
    Avx2,
    Avx512,
    Fma,
    F16c,
    Neon,
    Dotprod,
}

impl CpuFeature {
    /// All known features, in reporting order.
    pub fn all() -> &'static [CpuFeature] {
        &[
            CpuFeature::Sse3,
            CpuFeature::Ssse3,
            CpuFeature::Avx,
            CpuFeature::Avx2,
            CpuFeature::Avx512,
            CpuFeature::Fma,
            CpuFeature::F16c,
            CpuFeature::Neon,
            CpuFeature::Dotprod,
        ]
    }

    /// Whether the running CPU supports this feature.
    pub fn detected(self) -> bool {
        detect(self)
    }
}

#[cfg(target_arch = "x86_64")]
fn detect(feature: CpuFeature) -> bool {
    match feature {
        CpuFeature::Sse3 => std::arch::is_x86_feature_detected!("sse3"),
        CpuFeature::Ssse3 => std::arch::is_x86_feature_detected!("ssse3"),
        CpuFeature::Avx => std::arch::is_x86_feature_detected!("avx"),
        CpuFeature::Avx2 => std::arch::is_x86_feature_detected!("avx2"),
        CpuFeature::Avx512 => std::arch::is_x86_feature_detected!("avx512f"),
        CpuFeature::Fma => std::arch::is_x86_feature_detected!("fma"),
        CpuFeature::F16c => std::arch::is_x86_feature_detected!("f16c"),
        CpuFeature::Neon | CpuFeature::Dotprod => false,
    }
}

#[cfg(target_arch = "aarch64")]
fn detect(feature: CpuFeature) -> bool {
    match feature {
        CpuFeature::Neon => std::arch::is_aarch64_feature_detected!("neon"),
        CpuFeature::Dotprod => std::arch::is_aarch64_feature_detected!("dotprod"),
        _ => false,
    }
}

#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
fn detect(_feature: CpuFeature) -> bool {
    false
}

impl fmt::Display for CpuFeature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CpuFeature::Sse3 => "SSE3",
            CpuFeature::Ssse3 => "SSSE3",
            CpuFeature::Avx => "AVX",
            CpuFeature::Avx2 => "AVX2",
            CpuFeature::Avx512 => "AVX512",
            CpuFeature::Fma => "FMA",
            CpuFeature::F16c => "F16C",
            CpuFeature::Neon => "NEON",
            CpuFeature::Dotprod => "DOTPROD",
        };
        f.write_str(name)
    }
}

/// Errors from backend selection.
#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("no backends compiled (enable the `cpu` feature)")]
    NoBackendsCompiled,
}

/// Capability line: compiled backends followed by probed CPU features.
///
/// ```text
/// CPU : SSE3 = 1 | SSSE3 = 1 | AVX = 1 | ... | NEON = 0 | DOTPROD = 0
/// ```
pub fn system_info() -> String {
    let backends: Vec<String> = Backend::compiled().iter().map(|b| b.to_string()).collect();
    let features: Vec<String> = CpuFeature::all()
        .iter()
        .map(|f| format!("{f} = {}", u8::from(f.detected())))
        .collect();
    format!("{} : {}", backends.join(", "), features.join(" | "))
}
