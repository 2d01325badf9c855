/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - PATNET Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use std::net::SocketAddr;
use std::time::Duration;

#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub bind: SocketAddr,
    pub db_url: Option<String>,
    pub pg_pool_max_size: usize,
    pub pg_pool_wait_ms: Option<u64>,
    pub pg_init_retries: usize,
    pub pg_init_backoff_ms: u64,
    pub lease_max_hold_ms: u64,
    pub max_body_bytes: usize,
    pub nonce_salt: String,
    pub nonce_window_secs: u64,
    pub user_cookie: String,
    pub pass_cookie: String,
    pub trust_proxy_headers: bool,
    pub site_name: String,
    pub about_post_id: i64,
    pub hsts_max_age_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([0, 0, 0, 0], 8080)),
            db_url: None,
            pg_pool_max_size: 16,
            pg_pool_wait_ms: Some(5_000),
            pg_init_retries: 5,
            pg_init_backoff_ms: 500,
            lease_max_hold_ms: 2_000,
            max_body_bytes: 1_000_000,
            nonce_salt: "x".to_string(),
            nonce_window_secs: 7_200,
            user_cookie: "patnetuser".to_string(),
            pass_cookie: "patnetpass".to_string(),
            trust_proxy_headers: true,
            site_name: "patnet".to_string(),
            about_post_id: 1,
            hsts_max_age_secs: 0,
        }
    }
}

impl ServerConfig {
    pub fn lease_max_hold(&self) -> Duration {
        Duration::from_millis(self.lease_max_hold_ms)
    }

    pub fn nonce_window(&self) -> Duration {
        Duration::from_secs(self.nonce_window_secs)
    }
}

pub fn load_config() -> anyhow::Result<ServerConfig> {
    load_config_from(|key| std::env::var(key).ok())
}

fn load_config_from(var: impl Fn(&str) -> Option<String>) -> anyhow::Result<ServerConfig> {
    let defaults = ServerConfig::default();
    let bind = match var("PATNET_BIND") {
        Some(v) => v
            .parse::<SocketAddr>()
            .map_err(|e| anyhow::anyhow!("PATNET_BIND invalid: {e}"))?,
        None => defaults.bind,
    };
    let db_url = var("PATNET_DB_URL").map(|s| s.trim().to_string()).filter(|s| !s.is_empty());
    let pg_pool_max_size = var("PATNET_PG_POOL_MAX_SIZE")
        .and_then(|v| v.parse::<usize>().ok())
        .unwrap_or(defaults.pg_pool_max_size)
        .clamp(1, 512);
    let pg_pool_wait_ms = match var("PATNET_PG_POOL_WAIT_MS") {
        Some(v) => v.parse::<u64>().ok().filter(|ms| *ms > 0),
        None => defaults.pg_pool_wait_ms,
    };
    let pg_init_retries = var("PATNET_PG_INIT_RETRIES")
        .and_then(|v| v.parse::<usize>().ok())
        .unwrap_or(defaults.pg_init_retries)
        .clamp(1, 100);
    let pg_init_backoff_ms = var("PATNET_PG_INIT_BACKOFF_MS")
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(defaults.pg_init_backoff_ms);
    let lease_max_hold_ms = var("PATNET_LEASE_MAX_HOLD_MS")
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(defaults.lease_max_hold_ms)
        .clamp(100, 60_000);
    let max_body_bytes = var("PATNET_MAX_BODY_BYTES")
        .and_then(|v| v.parse::<usize>().ok())
        .unwrap_or(defaults.max_body_bytes)
        .max(1024);
    let nonce_salt = var("PATNET_NONCE_SALT")
        .filter(|s| !s.is_empty())
        .unwrap_or(defaults.nonce_salt);
    let nonce_window_secs = var("PATNET_NONCE_WINDOW_SECS")
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(defaults.nonce_window_secs);
    let user_cookie = var("PATNET_USER_COOKIE")
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .unwrap_or(defaults.user_cookie);
    let pass_cookie = var("PATNET_PASS_COOKIE")
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .unwrap_or(defaults.pass_cookie);
    let trust_proxy_headers = var("PATNET_TRUST_PROXY_HEADERS")
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(defaults.trust_proxy_headers);
    let site_name = var("PATNET_SITE_NAME")
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .unwrap_or(defaults.site_name);
    let about_post_id = var("PATNET_ABOUT_POST_ID")
        .and_then(|v| v.parse::<i64>().ok())
        .unwrap_or(defaults.about_post_id);
    let hsts_max_age_secs = var("PATNET_HSTS_MAX_AGE_SECS")
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(defaults.hsts_max_age_secs);

    if user_cookie == pass_cookie {
        anyhow::bail!("PATNET_USER_COOKIE and PATNET_PASS_COOKIE must differ");
    }

    Ok(ServerConfig {
        bind,
        db_url,
        pg_pool_max_size,
        pg_pool_wait_ms,
        pg_init_retries,
        pg_init_backoff_ms,
        lease_max_hold_ms,
        max_body_bytes,
        nonce_salt,
        nonce_window_secs,
        user_cookie,
        pass_cookie,
        trust_proxy_headers,
        site_name,
        about_post_id,
        hsts_max_age_secs,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn load(pairs: &[(&str, &str)]) -> anyhow::Result<ServerConfig> {
        let env: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        load_config_from(|k| env.get(k).cloned())
    }

    #[test]
    fn empty_env_gives_defaults() {
        let cfg = load(&[]).unwrap();
        assert_eq!(cfg.lease_max_hold(), Duration::from_secs(2));
        assert_eq!(cfg.max_body_bytes, 1_000_000);
        assert_eq!(cfg.nonce_window(), Duration::from_secs(7_200));
        assert!(cfg.trust_proxy_headers);
        assert!(cfg.db_url.is_none());
    }

    #[test]
    fn values_are_parsed_and_clamped() {
        let cfg = load(&[
            ("PATNET_BIND", "127.0.0.1:9000"),
            ("PATNET_PG_POOL_MAX_SIZE", "0"),
            ("PATNET_LEASE_MAX_HOLD_MS", "5"),
            ("PATNET_TRUST_PROXY_HEADERS", "false"),
            ("PATNET_DB_URL", "  "),
        ])
        .unwrap();
        assert_eq!(cfg.bind.port(), 9000);
        assert_eq!(cfg.pg_pool_max_size, 1);
        assert_eq!(cfg.lease_max_hold_ms, 100);
        assert!(!cfg.trust_proxy_headers);
        assert!(cfg.db_url.is_none());
    }

    #[test]
    fn bad_bind_is_an_error() {
        assert!(load(&[("PATNET_BIND", "nowhere")]).is_err());
    }

    #[test]
    fn cookie_names_must_differ() {
        assert!(load(&[("PATNET_USER_COOKIE", "a"), ("PATNET_PASS_COOKIE", "a")]).is_err());
    }
}
