//! Emulator support resources: executables, shared libraries and firmware.

use std::path::{Path, PathBuf};

use crate::config::ResourcesConfig;

/// Prefix shared by every emulator system binary (`qemu-system-x86_64`, ...).
pub const EMULATOR_PREFIX: &str = "qemu-system-";

/// Disk image utility binary name.
pub const IMAGE_TOOL: &str = "qemu-img";

#[derive(Debug, thiserror::Error)]
pub enum ResourceError {
    #[error("emulator resources not found at {}", .0.display())]
    Missing(PathBuf),
    #[error("emulator binary not found: {}", .0.display())]
    MissingBinary(PathBuf),
}

/// Resolved locations of the bundled emulator resources.
#[derive(Debug, Clone)]
pub struct Resources {
    bin_dir: PathBuf,
    lib_dir: PathBuf,
    data_dir: PathBuf,
}

impl Resources {
    pub fn new(config: &ResourcesConfig) -> Self {
        Self {
            bin_dir: config.bin_dir.clone(),
            lib_dir: config.lib_dir.clone(),
            data_dir: config.data_dir.clone(),
        }
    }

    pub fn bin_dir(&self) -> &Path {
        &self.bin_dir
    }

    /// Directory prepended to the children's dynamic library search path.
    pub fn lib_dir(&self) -> &Path {
        &self.lib_dir
    }

    /// Firmware directory passed to the emulator with `-L`.
    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    /// Check that the resource directories are in place before launching anything.
    pub fn ensure(&self) -> Result<(), ResourceError> {
        for dir in [&self.bin_dir, &self.data_dir] {
            if !dir.is_dir() {
                return Err(ResourceError::Missing(dir.clone()));
            }
        }
        Ok(())
    }

    /// Full path of a bundled executable, which must exist.
    pub fn binary(&self, name: &str) -> Result<PathBuf, ResourceError> {
        let path = self
            .bin_dir
            .join(format!("{name}{}", std::env::consts::EXE_SUFFIX));
        if path.is_file() {
            Ok(path)
        } else {
            Err(ResourceError::MissingBinary(path))
        }
    }

    /// Architectures that have a `qemu-system-<arch>` binary available, sorted.
    pub fn emulation_architectures(&self) -> Vec<String> {
        let Ok(entries) = std::fs::read_dir(&self.bin_dir) else {
            return Vec::new();
        };
        let suffix = std::env::consts::EXE_SUFFIX;
        let mut archs: Vec<String> = entries
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| entry.file_name().into_string().ok())
            .filter_map(|name| {
                let arch = name.strip_prefix(EMULATOR_PREFIX)?;
                let arch = arch.strip_suffix(suffix).unwrap_or(arch);
                (!arch.is_empty()).then(|| arch.to_string())
            })
            .collect();
        archs.sort();
        archs.dedup();
        archs
    }
}

/// Emulator architecture name matching the host CPU.
pub fn host_arch() -> &'static str {
    match std::env::consts::ARCH {
        "x86_64" => "x86_64",
        "x86" => "i386",
        "aarch64" => "aarch64",
        "arm" => "arm",
        "riscv64" => "riscv64",
        "powerpc64" => "ppc64",
        "s390x" => "s390x",
        "loongarch64" => "loongarch64",
        _ => "unknown_arch",
    }
}
