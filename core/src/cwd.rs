//! Best-effort "what directory is this shell in right now" lookup, used to keep
//! `Session::working_dir` current after each completed command (spec 4.4). POSIX: read the
//! `/proc/{pid}/cwd` symlink. macOS has no `/proc`, so fall back to `lsof`. Anywhere else,
//! there's nothing to ask, so the working directory just stays at its last known value.

#[cfg(target_os = "linux")]
pub fn read_cwd(pid: u32) -> Option<String> {
    std::fs::read_link(format!("/proc/{pid}/cwd"))
        .ok()
        .map(|p| p.to_string_lossy().into_owned())
}

#[cfg(target_os = "macos")]
pub fn read_cwd(pid: u32) -> Option<String> {
    let output = std::process::Command::new("lsof")
        .args(["-p", &pid.to_string(), "-a", "-d", "cwd", "-Fn"])
        .output()
        .ok()?;
    if !output.status.success() {
        return None;
    }
    String::from_utf8_lossy(&output.stdout)
        .lines()
        .find_map(|line| line.strip_prefix('n').map(str::to_string))
}

#[cfg(not(any(target_os = "linux", target_os = "macos")))]
pub fn read_cwd(_pid: u32) -> Option<String> {
    None
}
