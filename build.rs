//! Build script: checks for the Metal shader compiler when the `metal` feature is on.

fn main() {
    println!("cargo::rustc-check-cfg=cfg(missing_metal_toolchain)");

    // mistralrs compiles .metal shaders at build time and fails with an opaque
    // panic when `xcrun metal` is absent. Surface that as a cfg instead.
    #[cfg(all(feature = "metal", target_os = "macos"))]
    {
        let found = std::process::Command::new("xcrun")
            .args(["metal", "--version"])
            .output()
            .map(|o| o.status.success())
            .unwrap_or(false);

        if !found {
            println!(
                "cargo::warning=Metal Toolchain not found. Install it with: \
                 xcodebuild -downloadComponent MetalToolchain"
            );
            println!("cargo::rustc-cfg=missing_metal_toolchain");
        }
    }
}
