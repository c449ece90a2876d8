mod helpers;
mod scene;

#[cfg(not(target_arch = "wasm32"))]
pub use tokio::test as test_attr;

pub use helpers::*;
pub use scene::{TestScene, CAMERA, PROFILE};

/// Unwraps an adapter request, returning `Ok(())` from the calling test if
/// there is no adapter able to run herd's kernels.
#[macro_export]
macro_rules! no_gpu_return {
    ($value:expr) => {
        match $value {
            Ok(iad) if iad.mode == herd::RendererMode::GpuPowered => iad,
            Ok(_) => {
                eprintln!("Adapter can't run compute kernels, skipping test");
                return Ok(());
            }
            Err(e) => {
                eprintln!("No adapter available, skipping test: {e}");
                return Ok(());
            }
        }
    };
}

/// Sets up logging for a test. Safe to call from every test.
pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}
