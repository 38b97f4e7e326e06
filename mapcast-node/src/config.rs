//! Env-sourced configuration, mirroring the teacher's
//! `infra::config::Config::from_env` split between CLI overrides (`Args`,
//! parsed by `clap` in `main.rs`) and environment defaults. Plain
//! `env::var` reads with built-in fallbacks, not a generic config-file
//! crate — same as `ferrex-server`. Durations are human-readable strings
//! (`"750ms"`, `"1s"`), parsed with `humantime` the way the teacher's
//! `ferrexctl` rate-limit config does.

use std::env;
use std::path::PathBuf;
use std::time::Duration;

/// Default UDP port for the presence/control-plane messenger (spec §6
/// names 11999 as the example well-known presence port).
pub const DEFAULT_PRESENCE_PORT: u16 = 11999;

fn env_u16(key: &str, default: u16) -> u16 {
    env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn env_duration(key: &str, default: Duration) -> Duration {
    match env::var(key) {
        Ok(raw) => humantime::parse_duration(&raw).unwrap_or(default),
        Err(_) => default,
    }
}

/// Environment-sourced node configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub project_root: PathBuf,
    pub presence_port: u16,
    /// 0 means "OS-assigned ephemeral" (spec §3 "Node" `sync_port`).
    pub transport_port: u16,
    pub liveness_timeout: Duration,
    pub scan_interval: Duration,
    pub settle_time: Duration,
    pub sync_heartbeat_interval: Duration,
}

impl Config {
    /// Load defaults overridable by environment variables; CLI flags in
    /// `main.rs` take precedence over these (same precedence order as
    /// `ferrex-server::main`: CLI > env > built-in default).
    pub fn from_env() -> anyhow::Result<Self> {
        let project_root = env::var("MAPCAST_PROJECT_ROOT")
            .map(PathBuf::from)
            .unwrap_or_else(|_| std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")));

        Ok(Self {
            project_root,
            presence_port: env_u16("MAPCAST_PRESENCE_PORT", DEFAULT_PRESENCE_PORT),
            transport_port: env_u16("MAPCAST_TRANSPORT_PORT", 0),
            liveness_timeout: env_duration(
                "MAPCAST_LIVENESS_TIMEOUT",
                Duration::from_millis(mapcast_core::peer::DEFAULT_LIVENESS_TIMEOUT_MS),
            ),
            scan_interval: env_duration("MAPCAST_SCAN_INTERVAL", Duration::from_millis(500)),
            settle_time: env_duration("MAPCAST_SETTLE_TIME", Duration::from_millis(750)),
            sync_heartbeat_interval: env_duration("MAPCAST_SYNC_HEARTBEAT_INTERVAL", Duration::from_secs(1)),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unset_duration_falls_back_to_default() {
        let d = env_duration("MAPCAST_CONFIG_TEST_DURATION_UNSET", Duration::from_millis(750));
        assert_eq!(d, Duration::from_millis(750));
    }

    #[test]
    fn malformed_duration_falls_back_to_default() {
        std::env::set_var("MAPCAST_CONFIG_TEST_DURATION_BAD", "not-a-duration");
        let d = env_duration("MAPCAST_CONFIG_TEST_DURATION_BAD", Duration::from_millis(750));
        std::env::remove_var("MAPCAST_CONFIG_TEST_DURATION_BAD");
        assert_eq!(d, Duration::from_millis(750));
    }

    #[test]
    fn parses_humantime_duration_string() {
        std::env::set_var("MAPCAST_CONFIG_TEST_DURATION_OK", "250ms");
        let d = env_duration("MAPCAST_CONFIG_TEST_DURATION_OK", Duration::from_secs(99));
        std::env::remove_var("MAPCAST_CONFIG_TEST_DURATION_OK");
        assert_eq!(d, Duration::from_millis(250));
    }

    #[test]
    fn unset_port_falls_back_to_default() {
        assert_eq!(
            env_u16("MAPCAST_CONFIG_TEST_PORT_UNSET", DEFAULT_PRESENCE_PORT),
            DEFAULT_PRESENCE_PORT
        );
    }
}
