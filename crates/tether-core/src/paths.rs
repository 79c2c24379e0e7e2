use std::{env, path::PathBuf};

/// Resolves the relay daemon socket path from environment and platform defaults.
pub fn default_socket_path() -> PathBuf {
    if let Some(override_path) = env::var_os("TETHER_SOCKET") {
        return PathBuf::from(override_path);
    }

    if let Some(runtime_dir) = env::var_os("XDG_RUNTIME_DIR") {
        return PathBuf::from(runtime_dir).join("tetherd.sock");
    }

    PathBuf::from("/tmp/tetherd.sock")
}
