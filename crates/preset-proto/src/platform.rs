use std::path::PathBuf;

pub const DAEMON_TCP_PORT: u16 = 9877;

const DAEMON_TCP_HOST: &str = "127.0.0.1";
const APP_DIR: &str = "radio-presets";

pub fn daemon_address() -> String {
    format!("{}:{}", DAEMON_TCP_HOST, DAEMON_TCP_PORT)
}

/// IPC endpoint name for one mpv instance.  Every media handle runs its own
/// mpv process, so the name carries the daemon pid and the handle id.
#[cfg(unix)]
pub fn mpv_socket_name(handle_id: u64) -> String {
    format!(
        "{}/radio-presets-mpv-{}-{}.sock",
        std::env::temp_dir().display(),
        std::process::id(),
        handle_id
    )
}

#[cfg(windows)]
pub fn mpv_socket_name(handle_id: u64) -> String {
    format!("radio-presets-mpv-{}-{}", std::process::id(), handle_id)
}

#[cfg(unix)]
pub fn mpv_socket_arg(socket_name: &str) -> String {
    format!("--input-ipc-server={}", socket_name)
}

#[cfg(windows)]
pub fn mpv_socket_arg(socket_name: &str) -> String {
    format!("--input-ipc-server=\\\\.\\pipe\\{}", socket_name)
}

pub fn data_dir() -> PathBuf {
    // On macOS and Linux, use ~/.local/share/radio-presets/ (XDG standard)
    #[cfg(unix)]
    {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("/tmp"))
            .join(".local")
            .join("share")
            .join(APP_DIR)
    }
    #[cfg(windows)]
    {
        dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(APP_DIR)
    }
}

pub fn config_dir() -> PathBuf {
    // On Windows, check for portable config.toml in executable directory first
    #[cfg(windows)]
    {
        if let Ok(exe_path) = std::env::current_exe() {
            if let Some(exe_dir) = exe_path.parent() {
                let portable_config = exe_dir.join("config.toml");
                if portable_config.exists() {
                    return exe_dir.to_path_buf();
                }
            }
        }
    }

    #[cfg(unix)]
    {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".config")
            .join(APP_DIR)
    }

    #[cfg(windows)]
    {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(APP_DIR)
    }
}

#[cfg(unix)]
pub fn mpv_binary_name() -> &'static str {
    "mpv"
}

#[cfg(windows)]
pub fn mpv_binary_name() -> &'static str {
    "mpv.exe"
}

fn find_beside_exe(name: &str) -> Option<PathBuf> {
    let current_exe = std::env::current_exe().ok()?;
    let dir = current_exe.parent()?;
    let p = dir.join(name);
    if p.exists() {
        return Some(p);
    }
    let p = dir.join("external").join(name);
    if p.exists() {
        return Some(p);
    }
    None
}

fn find_on_path(name: &str) -> Option<PathBuf> {
    let path = std::env::var("PATH").ok()?;
    #[cfg(unix)]
    let sep = ":";
    #[cfg(windows)]
    let sep = ";";
    path.split(sep)
        .map(|dir| PathBuf::from(dir).join(name))
        .find(|p| p.exists())
}

/// Find the mpv binary.
///
/// Searches in order: the configured override, `MPV_PATH`, beside the current
/// executable, then `PATH`.
pub fn find_mpv_binary(configured: Option<&std::path::Path>) -> Option<PathBuf> {
    if let Some(p) = configured {
        if p.exists() {
            return Some(p.to_path_buf());
        }
    }

    if let Ok(p) = std::env::var("MPV_PATH") {
        let path = PathBuf::from(p);
        if path.exists() {
            return Some(path);
        }
    }

    find_beside_exe(mpv_binary_name()).or_else(|| find_on_path(mpv_binary_name()))
}
