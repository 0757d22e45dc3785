fn main() {
    // One string for the -v banner: "a1b2c3d 2026-08-01", or the date
    // alone when built outside a checkout.
    let mut info = match std::process::Command::new("git")
        .args(["describe", "--always", "--dirty"])
        .output()
    {
        Ok(out) if out.status.success() => {
            format!("{} ", String::from_utf8_lossy(&out.stdout).trim())
        }
        _ => String::new(),
    };
    info.push_str(&chrono::Utc::now().format("%Y-%m-%d").to_string());

    println!("cargo:rustc-env=DNSVEIL_BUILD_INFO={info}");
    println!("cargo:rerun-if-changed=.git/HEAD");
}
