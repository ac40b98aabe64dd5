use gpu_native::build::{FatbinConfig, link_fatbin};

fn main() {
    // Device code is only embedded for the CUDA launcher.
    if std::env::var_os("CARGO_FEATURE_CUDA").is_none() {
        return;
    }
    let config = FatbinConfig::new(["sm_70", "sm_86"])
        .host_arch(["x86_64", "armv7", "aarch64"])
        .cargo_rustc_args(["--release"])
        // Falls back to `ptxas`/`fatbinary` from PATH without docker.
        .default_docker_image();
    if let Err(e) = link_fatbin(&config) {
        panic!("Unable to link device code: {e}");
    }
}
