/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - PATNET Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use std::collections::HashMap;
use std::sync::Arc;

use patnet_protocol::ForumRequest;

use crate::admission::ConnectionLease;
use crate::config::ServerConfig;
use crate::error::ForumResult;
use crate::form::parse_urlencoded;
use crate::identity::{parse_cookies, Identity};
use crate::nonce::NonceGuard;

/// Process-wide, read-only settings every request can see.
pub struct Site {
    pub cfg: ServerConfig,
    pub nonce: NonceGuard,
}

impl Site {
    pub fn new(cfg: ServerConfig) -> Self {
        let nonce = NonceGuard::new(cfg.nonce_salt.clone(), cfg.nonce_window());
        Self { cfg, nonce }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Online {
    pub user_id: i64,
    pub user_name: String,
}

/// Site statistics shown in every page header.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeaderData {
    pub comments: i64,
    pub lurkers: i64,
    pub onlines: Vec<Online>,
    pub users: i64,
}

impl HeaderData {
    pub async fn load(lease: &mut ConnectionLease) -> ForumResult<Self> {
        let comments = count(lease, "select count(*) as c from comments").await?;
        let lurkers = count(lease, "select count(*) as c from lurkers").await?;
        let onlines = lease
            .query(
                "select online_user_id, online_username from onlines order by online_username",
                &[],
            )
            .await?
            .iter()
            .filter_map(|row| {
                Some(Online {
                    user_id: row.get_i64("online_user_id")?,
                    user_name: row.get_str("online_username")?.to_string(),
                })
            })
            .collect();
        let users = count(lease, "select count(*) as c from users").await?;
        Ok(Self {
            comments,
            lurkers,
            onlines,
            users,
        })
    }
}

async fn count(lease: &mut ConnectionLease, sql: &str) -> ForumResult<i64> {
    Ok(lease.scalar(sql, &[]).await?.and_then(|v| v.as_i64()).unwrap_or(0))
}

/// We assume there is exactly one level-4 user.
pub async fn load_admin_email(lease: &mut ConnectionLease) -> ForumResult<Option<String>> {
    Ok(lease
        .scalar("select user_email from users where user_level = 4 limit 1", &[])
        .await?
        .and_then(|v| v.as_str().map(str::to_string)))
}

/// Everything one in-flight request carries. Owned by that request alone.
pub struct RequestContext {
    pub ip: String,
    pub page: String,
    pub req: ForumRequest,
    pub start_time: i64,
    pub lease: ConnectionLease,
    pub current_user: Option<Identity>,
    pub header_data: HeaderData,
    pub admin_email: Option<String>,
    pub site: Arc<Site>,
    query: Vec<(String, String)>,
}

impl RequestContext {
    pub fn new(
        ip: String,
        page: String,
        req: ForumRequest,
        start_time: i64,
        lease: ConnectionLease,
        site: Arc<Site>,
    ) -> Self {
        let query = parse_urlencoded(&req.query);
        Self {
            ip,
            page,
            req,
            start_time,
            lease,
            current_user: None,
            header_data: HeaderData::default(),
            admin_email: None,
            site,
            query,
        }
    }

    /// Query-string value, or the empty string when absent.
    pub fn param(&self, name: &str) -> String {
        self.query
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.clone())
            .unwrap_or_default()
    }

    pub fn has_param(&self, name: &str) -> bool {
        self.query.iter().any(|(k, v)| k == name && !v.is_empty())
    }

    pub fn int_param(&self, name: &str) -> i64 {
        intval(&self.param(name))
    }

    pub fn cookies(&self) -> HashMap<String, String> {
        self.req.header("cookie").map(parse_cookies).unwrap_or_default()
    }

    pub fn user_agent(&self) -> Option<&str> {
        self.req.header("user-agent")
    }

    pub fn user_id(&self) -> Option<i64> {
        self.current_user.as_ref().map(|u| u.user.user_id)
    }

    /// `ts=..&nonce=..` for links that change state.
    pub fn nonce_params(&self) -> String {
        self.site.nonce.params(self.start_time)
    }

    pub fn nonce_valid(&self) -> bool {
        self.site.nonce.valid(self)
    }
}

/// Leading integer of a string, 0 when there is none ("12abc" -> 12, "x" -> 0).
pub fn intval(s: &str) -> i64 {
    let s = s.trim_start();
    let (sign, digits) = match s.as_bytes().first() {
        Some(b'-') => (-1, &s[1..]),
        Some(b'+') => (1, &s[1..]),
        _ => (1, s),
    };
    let end = digits
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(digits.len());
    digits[..end].parse::<i64>().map(|n| sign * n).unwrap_or(0)
}

/// Path split on `/` with everything but word characters and `%` stripped.
pub fn segments(path: &str) -> Vec<String> {
    let path = path.split(['?', '#']).next().unwrap_or("");
    path.split('/')
        .map(|seg| {
            seg.chars()
                .filter(|c| c.is_ascii_alphanumeric() || *c == '_' || *c == '%')
                .collect()
        })
        .collect()
}

/// Second path segment, `home` when there is none (`/post/47` -> `post`).
pub fn page_name(path: &str) -> String {
    segments(path)
        .into_iter()
        .nth(1)
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "home".to_string())
}

pub fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

#[cfg(test)]
pub(crate) async fn test_context(req: ForumRequest, pool: &crate::db::fake::FakePool) -> RequestContext {
    use crate::admission::AdmissionGate;
    use std::time::Duration;

    let gate = AdmissionGate::new(Arc::new(pool.clone()), Duration::from_secs(2));
    let ip = "10.9.8.7".to_string();
    let lease = gate.acquire(&ip).await.expect("lease");
    let page = page_name(&req.path);
    RequestContext::new(
        ip,
        page,
        req,
        now_ms(),
        lease,
        Arc::new(Site::new(ServerConfig::default())),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::fake::FakePool;
    use crate::db::Row;

    #[test]
    fn page_is_second_segment() {
        assert_eq!(page_name("/post/47"), "post");
        assert_eq!(page_name("/post/47/some-slug?offset=40"), "post");
        assert_eq!(page_name("/"), "home");
        assert_eq!(page_name(""), "home");
        assert_eq!(page_name("/comments?offset=0"), "comments");
        assert_eq!(page_name("/../etc"), "home");
    }

    #[test]
    fn segments_strip_punctuation() {
        assert_eq!(segments("/post/47/2024-01-01-hello"), vec!["", "post", "47", "20240101hello"]);
    }

    #[test]
    fn intval_reads_leading_digits() {
        assert_eq!(intval("40"), 40);
        assert_eq!(intval("12abc"), 12);
        assert_eq!(intval(" -3"), -3);
        assert_eq!(intval("3.9"), 3);
        assert_eq!(intval("abc"), 0);
        assert_eq!(intval(""), 0);
        assert_eq!(intval("-"), 0);
    }

    #[tokio::test]
    async fn params_default_to_empty() {
        let req = ForumRequest {
            method: "GET".into(),
            path: "/post/47".into(),
            query: "offset=40&order=new&empty=".into(),
            ..Default::default()
        };
        let ctx = test_context(req, &FakePool::new()).await;
        assert_eq!(ctx.page, "post");
        assert_eq!(ctx.param("order"), "new");
        assert_eq!(ctx.int_param("offset"), 40);
        assert_eq!(ctx.param("missing"), "");
        assert!(!ctx.has_param("empty"));
        assert!(ctx.has_param("offset"));
        assert_eq!(ctx.user_id(), None);
        assert!(ctx.cookies().is_empty());
    }

    #[tokio::test]
    async fn cookie_map_strips_whitespace() {
        let req = ForumRequest {
            headers: vec![("Cookie".into(), "a=1; b = two ;c=".into())],
            ..Default::default()
        };
        let ctx = test_context(req, &FakePool::new()).await;
        let cookies = ctx.cookies();
        assert_eq!(cookies.get("a").map(String::as_str), Some("1"));
        assert_eq!(cookies.get("b").map(String::as_str), Some("two"));
        assert_eq!(cookies.get("c").map(String::as_str), Some(""));
    }

    #[tokio::test]
    async fn header_data_loads_counts_and_onlines() {
        let pool = FakePool::new();
        pool.on("from comments", vec![Row::new().with("c", 120)]);
        pool.on("from lurkers", vec![Row::new().with("c", 3)]);
        pool.on(
            "from onlines",
            vec![Row::new()
                .with("online_user_id", 7)
                .with("online_username", "ann")],
        );
        pool.on("from users", vec![Row::new().with("c", 42)]);
        let mut ctx = test_context(ForumRequest::default(), &pool).await;

        let data = HeaderData::load(&mut ctx.lease).await.unwrap();
        assert_eq!(data.comments, 120);
        assert_eq!(data.lurkers, 3);
        assert_eq!(data.users, 42);
        assert_eq!(
            data.onlines,
            vec![Online {
                user_id: 7,
                user_name: "ann".into()
            }]
        );
    }
}
