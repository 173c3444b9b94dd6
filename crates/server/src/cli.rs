//! Thin CLI surface. Every flag has an env-var fallback; this replaces the
//! hand-rolled `parse_args` loop the teacher uses for its server binary with
//! `clap::Parser`, matching the `clap` derive convention used elsewhere in
//! the pack.

use std::path::PathBuf;

use clap::Parser;

#[derive(Debug, Parser)]
#[command(name = "tether-server", about = "ADB/scrcpy browser gateway")]
pub struct Args {
    /// Address to bind the HTTP/WebSocket listener to. Overrides a loaded
    /// config file's `[server].bind` only when explicitly set.
    #[arg(long, env = "TETHER_BIND")]
    pub bind: Option<String>,

    /// Port to bind the HTTP/WebSocket listener to. Overrides a loaded
    /// config file's `[server].port` only when explicitly set.
    #[arg(long, env = "TETHER_PORT")]
    pub port: Option<u16>,

    /// Directory holding persisted recording JSON files. Overrides a
    /// loaded config file's `[server].recordings_dir` only when explicitly
    /// set.
    #[arg(long, env = "TETHER_RECORDINGS_DIR")]
    pub recordings_dir: Option<PathBuf>,

    /// Directory holding uploaded APK/XAPK/ZIP files. Overrides a loaded
    /// config file's `[server].uploads_dir` only when explicitly set.
    #[arg(long, env = "TETHER_UPLOADS_DIR")]
    pub uploads_dir: Option<PathBuf>,

    /// Optional path to a TOML config file overriding the above.
    #[arg(long, env = "TETHER_CONFIG")]
    pub config: Option<PathBuf>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_with_no_args() {
        let args = Args::parse_from(["tether-server"]);
        assert_eq!(args.bind, None);
        assert_eq!(args.port, None);
        assert_eq!(args.recordings_dir, None);
    }

    #[test]
    fn parses_explicit_flags() {
        let args = Args::parse_from([
            "tether-server",
            "--bind",
            "127.0.0.1",
            "--port",
            "9999",
        ]);
        assert_eq!(args.bind, Some("127.0.0.1".to_string()));
        assert_eq!(args.port, Some(9999));
    }
}
