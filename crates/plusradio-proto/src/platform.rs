use std::path::{Path, PathBuf};

/// TCP port of the daemon's client socket.
pub const DAEMON_TCP_PORT: u16 = 9877;

const APP_DIR: &str = "plusradio";

/// Overrides mpv discovery when set to an existing file.
const MPV_PATH_ENV: &str = "MPV_PATH";

#[cfg(unix)]
const MPV_BINARY: &str = "mpv";
#[cfg(windows)]
const MPV_BINARY: &str = "mpv.exe";

#[cfg(unix)]
pub fn mpv_socket_name() -> String {
    std::env::temp_dir()
        .join("plusradio-mpv.sock")
        .display()
        .to_string()
}

#[cfg(windows)]
pub fn mpv_socket_name() -> String {
    "plusradio-mpv".to_string()
}

pub fn mpv_socket_arg() -> String {
    #[cfg(unix)]
    let target = mpv_socket_name();
    #[cfg(windows)]
    let target = format!("\\\\.\\pipe\\{}", mpv_socket_name());
    format!("--input-ipc-server={}", target)
}

/// Where the registry and the daemon log live.
pub fn data_dir() -> PathBuf {
    // XDG-style layout on every unix, macOS included
    #[cfg(unix)]
    let base = dirs::home_dir().map(|home| home.join(".local").join("share"));
    #[cfg(windows)]
    let base = dirs::data_local_dir();

    base.unwrap_or_else(std::env::temp_dir).join(APP_DIR)
}

pub fn config_dir() -> PathBuf {
    #[cfg(unix)]
    let base = dirs::home_dir().map(|home| home.join(".config"));
    #[cfg(windows)]
    let base = dirs::config_dir();

    base.unwrap_or_else(|| PathBuf::from(".")).join(APP_DIR)
}

fn is_file(path: &Path) -> bool {
    path.metadata().map(|m| m.is_file()).unwrap_or(false)
}

/// Locate mpv: `MPV_PATH`, then next to our own executable, then `PATH`.
pub fn find_mpv_binary() -> Option<PathBuf> {
    let from_env = std::env::var_os(MPV_PATH_ENV).map(PathBuf::from);
    let beside_exe = std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(|dir| dir.join(MPV_BINARY)));
    let on_path = std::env::var_os("PATH")
        .map(|paths| {
            std::env::split_paths(&paths)
                .map(|dir| dir.join(MPV_BINARY))
                .collect::<Vec<_>>()
        })
        .unwrap_or_default();

    from_env
        .into_iter()
        .chain(beside_exe)
        .chain(on_path)
        .find(|candidate| is_file(candidate))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dirs_are_app_scoped() {
        assert!(data_dir().ends_with(APP_DIR));
        assert!(config_dir().ends_with(APP_DIR));
    }

    #[test]
    fn test_socket_arg_names_socket() {
        assert!(mpv_socket_arg().starts_with("--input-ipc-server="));
        assert!(mpv_socket_arg().contains("plusradio-mpv"));
    }
}
