//! Compiles the CUDA kernels to PTX when the `cuda` feature is enabled.

fn main() {
    #[cfg(feature = "cuda")]
    cuda::build();
}

#[cfg(feature = "cuda")]
mod cuda {
    use std::env;
    use std::path::{Path, PathBuf};
    use std::process::Command;

    /// Lowest target; every kernel only needs warp shuffles and f32 atomics.
    const ARCH: &str = "sm_75";

    /// Kernel sources relative to the crate root.
    const SOURCES: &[&str] = &[
        "src/ops/cuda/kernels/attention/mem_eff_attention.cu",
        "src/ops/cuda/kernels/attention/mem_eff_attention_bwd.cu",
        "src/ops/cuda/kernels/sparse/sparse_ops.cu",
    ];

    /// Headers included by the sources above.
    const HEADERS: &[&str] = &["src/ops/cuda/kernels/attention/dropout.cuh"];

    pub fn build() {
        let out_dir = PathBuf::from(env::var("OUT_DIR").expect("OUT_DIR is set by cargo"));
        let nvcc = nvcc().unwrap_or_else(|| {
            panic!(
                "nvcc not found: the `cuda` feature needs the CUDA Toolkit \
                 (set CUDA_PATH or put nvcc on PATH)"
            )
        });

        for src in SOURCES {
            let src = Path::new(src);
            println!("cargo:rerun-if-changed={}", src.display());
            compile(&nvcc, src, &out_dir);
        }
        for header in HEADERS {
            println!("cargo:rerun-if-changed={header}");
        }
        println!("cargo:rerun-if-env-changed=CUDA_PATH");
        println!("cargo:rustc-env=CUDA_KERNEL_DIR={}", out_dir.display());
    }

    fn compile(nvcc: &Path, src: &Path, out_dir: &Path) {
        assert!(src.exists(), "missing kernel source {}", src.display());
        let stem = src.file_stem().and_then(|s| s.to_str()).unwrap_or_default();
        let ptx = out_dir.join(format!("{stem}.ptx"));
        let include = src.parent().unwrap_or(Path::new("."));

        let output = Command::new(nvcc)
            .arg("-ptx")
            .arg("-O3")
            .arg("--use_fast_math")
            .arg(format!("-arch={ARCH}"))
            .arg(format!("-I{}", include.display()))
            .arg("-o")
            .arg(&ptx)
            .arg(src)
            .output()
            .unwrap_or_else(|e| panic!("failed to run {}: {e}", nvcc.display()));

        if !output.status.success() {
            panic!(
                "nvcc failed on {}:\n{}{}",
                src.display(),
                String::from_utf8_lossy(&output.stdout),
                String::from_utf8_lossy(&output.stderr)
            );
        }
    }

    fn nvcc() -> Option<PathBuf> {
        let from_env = env::var_os("CUDA_PATH").map(|p| PathBuf::from(p).join("bin/nvcc"));
        let candidates = from_env.into_iter().chain(
            ["/usr/local/cuda/bin/nvcc", "/opt/cuda/bin/nvcc"]
                .into_iter()
                .map(PathBuf::from),
        );
        for candidate in candidates {
            if candidate.exists() {
                return Some(candidate);
            }
        }
        Command::new("nvcc")
            .arg("--version")
            .output()
            .ok()
            .filter(|o| o.status.success())
            .map(|_| PathBuf::from("nvcc"))
    }
}
