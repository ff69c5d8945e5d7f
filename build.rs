// Short git hash for the startup log line. Builds outside a checkout get none.
fn main() {
    println!("cargo:rerun-if-changed=.git/HEAD");
    let Ok(output) = std::process::Command::new("git")
        .args(["rev-parse", "--short", "HEAD"])
        .output()
    else {
        return;
    };
    if !output.status.success() {
        return;
    }
    if let Ok(hash) = String::from_utf8(output.stdout) {
        println!("cargo:rustc-env=STEPREEL_GIT_HASH={}", hash.trim());
    }
}
