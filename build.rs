//! Build script for tilr
//!
//! Compiles the CUDA tile kernels to PTX when the cuda feature is enabled.
//!
//! # Requirements
//!
//! - CUDA Toolkit (nvcc compiler)
//! - Compute Capability 7.5+ (Turing architecture, sm_75)
//!
//! # Environment Variables
//!
//! - `CUDA_PATH`: Custom CUDA installation path (optional)

fn main() {
    #[cfg(feature = "cuda")]
    compile_cuda_kernels();
}

#[cfg(feature = "cuda")]
fn compile_cuda_kernels() {
    use std::env;
    use std::path::PathBuf;
    use std::process::Command;

    let out_dir = PathBuf::from(env::var("OUT_DIR").unwrap());
    let kernels_dir = PathBuf::from("src/cuda/kernels");

    let kernel_files = ["gemm.cu"];

    let nvcc = find_nvcc().unwrap_or_else(|| {
        panic!(
            "nvcc not found - the CUDA Toolkit must be installed for the 'cuda' feature. \
             Set CUDA_PATH or add nvcc to PATH."
        )
    });

    for kernel_file in kernel_files {
        let cu_path = kernels_dir.join(kernel_file);
        let ptx_name = kernel_file.replace(".cu", ".ptx");
        let ptx_path = out_dir.join(&ptx_name);

        println!("cargo:rerun-if-changed={}", cu_path.display());

        if !cu_path.exists() {
            panic!("CUDA kernel source not found: {}", cu_path.display());
        }

        let output = Command::new(&nvcc)
            .args([
                "-ptx",
                "-O3",
                "-arch=sm_75",
                "-o",
                ptx_path.to_str().unwrap(),
                cu_path.to_str().unwrap(),
            ])
            .output()
            .unwrap_or_else(|e| panic!("failed to run nvcc: {e}"));

        if !output.status.success() {
            panic!(
                "nvcc failed on {}:\n{}",
                cu_path.display(),
                String::from_utf8_lossy(&output.stderr)
            );
        }
    }

    println!("cargo:rustc-env=CUDA_KERNEL_DIR={}", out_dir.display());
}

#[cfg(feature = "cuda")]
fn find_nvcc() -> Option<std::path::PathBuf> {
    use std::path::PathBuf;

    if let Ok(cuda_path) = std::env::var("CUDA_PATH") {
        let candidate = PathBuf::from(cuda_path).join("bin").join("nvcc");
        if candidate.exists() {
            return Some(candidate);
        }
    }

    for dir in ["/usr/local/cuda/bin", "/opt/cuda/bin"] {
        let candidate = PathBuf::from(dir).join("nvcc");
        if candidate.exists() {
            return Some(candidate);
        }
    }

    // Fall back to PATH lookup.
    std::env::var_os("PATH").and_then(|paths| {
        std::env::split_paths(&paths)
            .map(|p| p.join("nvcc"))
            .find(|p| p.exists())
    })
}
