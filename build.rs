fn main() {
    println!("cargo:rerun-if-env-changed=LIBTORCH");

    // Only the TorchScript detector needs libtorch on the link line.
    if std::env::var_os("CARGO_FEATURE_TORCH").is_none() {
        return;
    }

    let libtorch_path = std::env::var("LIBTORCH").unwrap_or_else(|_| {
        let path = std::path::PathBuf::from("libtorch");
        path.to_string_lossy().into_owned()
    });

    println!("cargo:rustc-link-search=native={}/lib", libtorch_path);
    println!("cargo:rustc-link-lib=dylib=torch");
    println!("cargo:rustc-link-lib=dylib=c10");

    println!("cargo:include={}/include", libtorch_path);
    println!("cargo:include={}/include/torch/csrc/api/include", libtorch_path);
}
