fn main() {
    println!("cargo:rerun-if-changed=linker.ld");
    let os = std::env::var("CARGO_CFG_TARGET_OS").unwrap_or_default();
    if os == "none" {
        println!("cargo:rustc-link-arg-bins=-Tlinker.ld");
    }
}
