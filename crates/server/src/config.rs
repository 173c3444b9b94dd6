//! Server-crate entry point into `tether_protocol`'s config schema: resolves
//! a `GatewayConfig` from a TOML file (if given) layered under environment
//! variables and CLI flags. Grounded on the teacher's `load_config`, which
//! falls back to defaults when the file is absent instead of failing.

use std::path::Path;

use anyhow::Result;
use tether_protocol::GatewayConfig;

use crate::cli::Args;

/// Resolve the effective configuration: start from `GatewayConfig::from_env`,
/// layer a TOML file on top if `--config`/`TETHER_CONFIG` was given, then
/// apply only the CLI flags/env vars the caller actually set (an unset flag
/// leaves whatever the TOML file or env-derived default already put there)
/// before validating.
pub fn resolve(args: &Args) -> Result<GatewayConfig> {
    let mut config = match &args.config {
        Some(path) => GatewayConfig::load_from_path(path)?,
        None => GatewayConfig::from_env(),
    };

    if let Some(bind) = &args.bind {
        config.server.bind = bind.clone();
    }
    if let Some(port) = args.port {
        config.server.port = port;
    }
    if let Some(recordings_dir) = &args.recordings_dir {
        config.server.recordings_dir = recordings_dir.to_string_lossy().into_owned();
    }
    if let Some(uploads_dir) = &args.uploads_dir {
        config.server.uploads_dir = uploads_dir.to_string_lossy().into_owned();
    }

    if let Err(problems) = config.validate() {
        for problem in &problems {
            if problem.starts_with("ERROR:") {
                tracing::error!("{problem}");
            } else {
                tracing::warn!("{problem}");
            }
        }
        if problems.iter().any(|p| p.starts_with("ERROR:")) {
            anyhow::bail!("invalid configuration: {}", problems.join("; "));
        }
    }

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_applies_cli_overrides_over_defaults() {
        let args = Args {
            bind: Some("127.0.0.1".to_string()),
            port: Some(9001),
            recordings_dir: Some(Path::new("recs").to_path_buf()),
            uploads_dir: Some(Path::new("ups").to_path_buf()),
            config: None,
        };
        let config = resolve(&args).unwrap();
        assert_eq!(config.server.bind, "127.0.0.1");
        assert_eq!(config.server.port, 9001);
        assert_eq!(config.server.recordings_dir, "recs");
    }

    #[test]
    fn resolve_leaves_config_file_values_when_cli_unset() {
        let dir = std::env::temp_dir().join(format!("tether-config-test-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("tether.toml");
        std::fs::write(&path, "[server]\nbind = \"10.0.0.1\"\nport = 7000\n").unwrap();

        let args = Args {
            bind: None,
            port: None,
            recordings_dir: None,
            uploads_dir: None,
            config: Some(path),
        };
        let config = resolve(&args).unwrap();
        assert_eq!(config.server.bind, "10.0.0.1");
        assert_eq!(config.server.port, 7000);
    }
}
