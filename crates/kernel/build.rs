fn main() {
    let arch = std::env::var("CARGO_CFG_TARGET_ARCH").unwrap();
    let manifest_dir = std::env::var("CARGO_MANIFEST_DIR").unwrap();
    let script = std::path::Path::new(&manifest_dir).join(format!("linker-{arch}.ld"));
    // Only bare-metal targets carry a linker script for this architecture.
    if script.exists() {
        println!("cargo:rustc-link-arg=-T{}", script.display());
    }
    println!("cargo:rerun-if-changed={}", script.display());
}
