use gpu_native::emulator::LaunchError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum HarnessError {
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("kernel launch failed: {0}")]
    Launch(#[from] LaunchError),
    /// A CUDA driver call failed; `call` names it.
    #[cfg(feature = "cuda")]
    #[error("{call} failed: {code:?}")]
    Device {
        call: &'static str,
        code: gpu_native::cudarc::driver::DriverError,
    },
}

#[cfg(feature = "cuda")]
impl HarnessError {
    /// `map_err` adaptor naming the failed driver call.
    pub fn device(call: &'static str) -> impl Fn(gpu_native::cudarc::driver::DriverError) -> Self {
        move |code| Self::Device { call, code }
    }
}
