//! Build-script side of the CUDA backend: compiles the calling crate for
//! `nvptx64-nvidia-cuda` once per SM version, assembles the PTX with
//! `ptxas`, bundles the cubins with `fatbinary` and links the result into
//! the host binary under `<CARGO_PKG_NAME>_FATBIN_CODE_7B4EA9D2`.
//!
//! ```ignore
//! fn main() {
//!     let config = FatbinConfig::new(["sm_86"]).cargo_rustc_args(["--release"]);
//!     if let Err(e) = gpu_native::build::link_fatbin(&config) {
//!         panic!("{e}");
//!     }
//! }
//! ```

use std::collections::HashSet;
use std::ffi::OsStr;
use std::fmt::Write as _;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::process::{Command, ExitStatus};

use log::{debug, info, warn};
use thiserror::Error;

/// Prefix of every embedded fatbinary.
pub const FATBIN_MAGIC: u64 = 0xB0BACAFEB0BACAFE;
pub const FATBIN_SYMBOL_SUFFIX: &str = "_FATBIN_CODE_7B4EA9D2";
const NVPTX_TARGET: &str = "nvptx64-nvidia-cuda";
const DEFAULT_DOCKER_IMAGE: &str = "nvidia/cuda:12.6.3-devel-ubuntu24.04";

#[derive(Debug, Error)]
pub enum BuildError {
    #[error("environment variable `{0}` is not set")]
    MissingEnv(&'static str),
    #[error("target '{0}' is neither a configured host nor the GPU architecture; add \"{1}\" to `host_arch`")]
    UnknownTarget(String, String),
    #[error("unable to run `{tool}`: {source}")]
    Spawn {
        tool: &'static str,
        source: std::io::Error,
    },
    #[error("`{tool}` failed with {status}")]
    ToolFailed {
        tool: &'static str,
        status: ExitStatus,
    },
    #[error("no build artifact under {0}")]
    MissingArtifact(PathBuf),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Clone, Debug)]
pub struct FatbinConfig {
    sm: Vec<String>,
    host_arch: Vec<String>,
    cargo_rustc_args: Vec<String>,
    docker_image: Option<String>,
}

impl FatbinConfig {
    pub fn new<S: Into<String>>(sm: impl IntoIterator<Item = S>) -> Self {
        Self {
            sm: sm.into_iter().map(Into::into).collect(),
            host_arch: vec!["x86_64".into(), "armv7".into(), "aarch64".into()],
            cargo_rustc_args: vec![],
            docker_image: None,
        }
    }

    pub fn host_arch<S: Into<String>>(mut self, archs: impl IntoIterator<Item = S>) -> Self {
        self.host_arch = archs.into_iter().map(Into::into).collect();
        self
    }

    pub fn cargo_rustc_args<S: Into<String>>(mut self, args: impl IntoIterator<Item = S>) -> Self {
        self.cargo_rustc_args = args.into_iter().map(Into::into).collect();
        self
    }

    /// Run `ptxas` and `fatbinary` inside this image instead of from `PATH`.
    pub fn docker_image(mut self, image: impl Into<String>) -> Self {
        self.docker_image = Some(image.into());
        self
    }

    /// [`Self::docker_image`] with the CUDA devel image the kernels are tested against.
    pub fn default_docker_image(self) -> Self {
        self.docker_image(DEFAULT_DOCKER_IMAGE)
    }

    fn is_host(&self, target: &str) -> bool {
        self.host_arch.iter().any(|host| target.contains(host.as_str()))
    }
}

fn env(var: &'static str) -> Result<String, BuildError> {
    std::env::var(var).map_err(|_| BuildError::MissingEnv(var))
}

fn check(tool: &'static str, status: std::io::Result<ExitStatus>) -> Result<(), BuildError> {
    let status = status.map_err(|source| BuildError::Spawn { tool, source })?;
    if status.success() {
        Ok(())
    } else {
        Err(BuildError::ToolFailed { tool, status })
    }
}

/// Runs CUDA toolkit binaries either directly or through docker, with the
/// build directory mounted as the working directory.
struct Toolchain<'a> {
    build_dir: &'a Path,
    docker_image: Option<&'a str>,
}

impl Toolchain<'_> {
    fn command(&self, tool: &'static str) -> Command {
        match self.docker_image {
            Some(image) => {
                let mut cmd = Command::new("docker");
                cmd.args(["run", "--rm", "-v"])
                    .arg(format!("{}:/work", self.build_dir.display()))
                    .args(["-w", "/work", image, tool]);
                cmd
            }
            None => {
                let mut cmd = Command::new(tool);
                cmd.current_dir(self.build_dir);
                cmd
            }
        }
    }
}

fn docker_available() -> bool {
    match Command::new("docker").arg("--version").output() {
        Ok(out) => out.status.success(),
        Err(e) if e.kind() == ErrorKind::NotFound => false,
        Err(e) => {
            warn!("unexpected error '{e}' when probing for docker");
            false
        }
    }
}

/// Renders the fatbinary as a Rust source file exporting one `no_mangle`
/// byte slice, prefixed by [`FATBIN_MAGIC`].
pub fn embed_fatbin_source(link_name: &str, fatbin: &[u8]) -> String {
    let mut source = String::with_capacity(6 * (fatbin.len() + 8) + 64);
    source.push_str(&format!("#[unsafe(no_mangle)] static {link_name}: &[u8] = &[\n"));
    for byte in FATBIN_MAGIC.to_le_bytes().iter().chain(fatbin) {
        let _ = writeln!(source, "0x{byte:02x},");
    }
    source.push_str("];\n");
    source
}

fn find_profile_dir(nvptx_dir: &Path) -> Result<PathBuf, BuildError> {
    for entry in nvptx_dir.read_dir()? {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            return Ok(entry.path());
        }
    }
    Err(BuildError::MissingArtifact(nvptx_dir.to_path_buf()))
}

/// Entry point for build scripts. Does nothing when the crate itself is being
/// compiled for the GPU (the nested `cargo rustc` below).
pub fn link_fatbin(config: &FatbinConfig) -> Result<(), BuildError> {
    let target = env("TARGET")?;
    if !config.is_host(&target) {
        if target == NVPTX_TARGET {
            return Ok(());
        }
        let arch = target.split('-').next().unwrap_or(&target).to_string();
        return Err(BuildError::UnknownTarget(target, arch));
    }

    let pkg_name = env("CARGO_PKG_NAME")?;
    let out_dir = PathBuf::from(env("OUT_DIR")?);
    let build_dir = out_dir.join("fatbin-build");
    if build_dir.exists() {
        std::fs::remove_dir_all(&build_dir)?;
    }
    std::fs::create_dir_all(&build_dir)?;

    let mut docker_image = config.docker_image.as_deref();
    if docker_image.is_some() && !docker_available() {
        println!("cargo::warning=Docker doesn't exist. Trying to compile with system executables.");
        docker_image = None;
    }
    let toolchain = Toolchain {
        build_dir: &build_dir,
        docker_image,
    };

    let mut fatbin_args = vec!["--create=lib.fatbin".to_string(), "--64".to_string()];
    let mut already_assembled: HashSet<PathBuf> = HashSet::new();
    let include_ddash = !config.cargo_rustc_args.iter().any(|arg| arg == "--");

    for sm in &config.sm {
        info!("compiling {pkg_name} for {sm}");
        let mut cargo = Command::new("cargo");
        cargo
            .arg("rustc")
            .arg(format!("--target-dir={}", build_dir.display()))
            .arg(format!("--target={NVPTX_TARGET}"))
            .args(&config.cargo_rustc_args);
        if include_ddash {
            cargo.arg("--");
        }
        cargo.args([
            "-C",
            &format!("target-cpu={sm}"),
            "-C",
            &format!("target-feature=+{sm}"),
            "-C",
            "panic=abort",
            "--emit=asm",
        ]);
        check("cargo", cargo.status())?;

        let deps_dir = find_profile_dir(&build_dir.join(NVPTX_TARGET))?.join("deps");
        let mut assembling = vec![];
        for dep in deps_dir.read_dir()? {
            let dep = dep?.path();
            if dep.extension() != Some(OsStr::new("s")) || !already_assembled.insert(dep.clone()) {
                continue;
            }
            let rel_path = dep
                .strip_prefix(&build_dir)
                .map_err(|_| BuildError::MissingArtifact(dep.clone()))?
                .to_path_buf();
            debug!("ptxas {}", rel_path.display());
            let child = toolchain
                .command("ptxas")
                .arg(format!("-arch={sm}"))
                .arg(&rel_path)
                .arg("-o")
                .arg(format!("{}.cubin", rel_path.display()))
                .spawn()
                .map_err(|source| BuildError::Spawn {
                    tool: "ptxas",
                    source,
                })?;
            assembling.push((rel_path, child));
        }

        for (rel_path, mut child) in assembling {
            check("ptxas", child.wait())?;
            fatbin_args.push(format!("--image=profile={sm},file={}.cubin", rel_path.display()));
        }
    }

    check("fatbinary", toolchain.command("fatbinary").args(&fatbin_args).status())?;

    let fatbin = std::fs::read(build_dir.join("lib.fatbin"))?;
    let link_name = format!("{pkg_name}{FATBIN_SYMBOL_SUFFIX}");
    std::fs::write(build_dir.join("fatbin.rs"), embed_fatbin_source(&link_name, &fatbin))?;
    check(
        "rustc",
        Command::new("rustc")
            .current_dir(&build_dir)
            .args(["--crate-type=lib", "--emit=obj", "fatbin.rs"])
            .status(),
    )?;

    let object = out_dir.join(format!("{pkg_name}_fatbin.o"));
    std::fs::rename(build_dir.join("fatbin.o"), &object)?;
    std::fs::rename(build_dir.join("lib.fatbin"), out_dir.join("lib.fatbin"))?;
    info!("embedded {} bytes of device code as {link_name}", fatbin.len());

    println!("cargo:rustc-link-arg={}", object.display());
    println!("cargo:rerun-if-changed=src");
    Ok(())
}
