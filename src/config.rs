//! Endpoint resolution and logging setup.

use std::path::PathBuf;

use tracing_subscriber::EnvFilter;

/// Environment variable overriding the socket path.
pub const SOCKET_ENV: &str = "INSTANCED_SOCKET";

const SOCKET_NAME: &str = "instanced.sock";

/// Default socket path: `$XDG_RUNTIME_DIR/instanced.sock`, or
/// `/tmp/instanced-<uid>.sock` when no runtime dir is set.
pub fn default_socket_path() -> PathBuf {
    match std::env::var_os("XDG_RUNTIME_DIR") {
        Some(dir) if !dir.is_empty() => PathBuf::from(dir).join(SOCKET_NAME),
        _ => fallback_socket_path(),
    }
}

fn fallback_socket_path() -> PathBuf {
    let uid = nix::unistd::getuid();
    PathBuf::from("/tmp").join(format!("instanced-{uid}.sock"))
}

/// Install the global subscriber. Filter comes from `RUST_LOG`, default
/// `info`. Logs go to stderr.
pub fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}
