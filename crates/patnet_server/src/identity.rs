/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - PATNET Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

//! Cookie-pair authentication and the per-request relationship graph.

use std::collections::HashMap;

use patnet_protocol::ForumRequest;
use tracing::debug;

use crate::admission::ConnectionLease;
use crate::config::ServerConfig;
use crate::context::RequestContext;
use crate::db::{Row, Value};
use crate::error::ForumResult;

const MIN_PASS_PREFIX: usize = 8;

const USER_SQL: &str = "select user_id, user_name, user_email, user_level, user_comments from users \
     where user_id = $1 and left(user_pass, char_length($2::text)) = $2::text";

const MY_POV_SQL: &str = "select relationships.*, users.user_name from relationships \
     left join users on users.user_id = relationships.rel_other_id \
     where rel_self_id = $1 and (rel_my_friend > 0 or rel_i_ban > 0 or rel_i_follow > 0)";

const OTHER_POV_SQL: &str = "select relationships.*, users.user_name from relationships \
     left join users on users.user_id = relationships.rel_self_id \
     where rel_other_id = $1 and (rel_my_friend > 0 or rel_i_ban > 0 or rel_i_follow > 0)";

const PRUNE_ONLINES_SQL: &str = "delete from onlines where online_last_view < now() - interval '5 minutes'";
const TOUCH_ONLINE_SQL: &str = "insert into onlines (online_user_id, online_username, online_last_view) \
     values ($1, $2, now()) on conflict (online_user_id) do update set online_last_view = now()";

const PRUNE_LURKERS_SQL: &str = "delete from lurkers where lurker_last_view < now() - interval '5 minutes'";
const TOUCH_LURKER_SQL: &str = "insert into lurkers (lurker_username, lurker_last_view) \
     values ($1, now()) on conflict (lurker_username) do update set lurker_last_view = now()";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct User {
    pub user_id: i64,
    pub user_name: String,
    pub user_email: Option<String>,
    pub user_level: i64,
    pub user_comments: i64,
}

impl User {
    fn from_row(row: &Row) -> Option<Self> {
        Some(Self {
            user_id: row.get_i64("user_id").filter(|id| *id > 0)?,
            user_name: row.get_str("user_name").unwrap_or_default().to_string(),
            user_email: row.get_str("user_email").map(str::to_string),
            user_level: row.get_i64("user_level").unwrap_or(0),
            user_comments: row.get_i64("user_comments").unwrap_or(0),
        })
    }
}

/// One non-trivial edge of the social graph. Flag columns hold the unix time they were set, 0 when unset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Relationship {
    pub self_id: i64,
    pub other_id: i64,
    pub other_name: Option<String>,
    pub friend_since: i64,
    pub ban_since: i64,
    pub follow_since: i64,
}

impl Relationship {
    fn from_row(row: &Row) -> Option<Self> {
        Some(Self {
            self_id: row.get_i64("rel_self_id")?,
            other_id: row.get_i64("rel_other_id")?,
            other_name: row.get_str("user_name").map(str::to_string),
            friend_since: row.get_i64("rel_my_friend").unwrap_or(0),
            ban_since: row.get_i64("rel_i_ban").unwrap_or(0),
            follow_since: row.get_i64("rel_i_follow").unwrap_or(0),
        })
    }

    pub fn is_friend(&self) -> bool {
        self.friend_since > 0
    }

    pub fn is_ban(&self) -> bool {
        self.ban_since > 0
    }

    pub fn is_follow(&self) -> bool {
        self.follow_since > 0
    }
}

/// A logged-in user and how they relate to everyone else.
///
/// A missing key in either map means there is no non-trivial relationship.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub user: User,
    /// Keyed by the other party: edges this user created.
    pub blocks_others: HashMap<i64, Relationship>,
    /// Keyed by the other party: edges created against this user.
    pub blocked_by_others: HashMap<i64, Relationship>,
}

impl Identity {
    pub fn ignores(&self, other_id: i64) -> bool {
        self.blocks_others.get(&other_id).is_some_and(Relationship::is_ban)
    }

    pub fn ignored_by(&self, other_id: i64) -> bool {
        self.blocked_by_others
            .get(&other_id)
            .is_some_and(Relationship::is_ban)
    }

    pub fn follows(&self, other_id: i64) -> bool {
        self.blocks_others
            .get(&other_id)
            .is_some_and(Relationship::is_follow)
    }

    /// Either side has put the other on ignore.
    pub fn hidden_from(&self, other_id: i64) -> bool {
        self.ignores(other_id) || self.ignored_by(other_id)
    }
}

pub fn parse_cookies(header: &str) -> HashMap<String, String> {
    header
        .split(';')
        .filter_map(|pair| {
            let pair: String = pair.chars().filter(|c| !c.is_whitespace()).collect();
            let (name, value) = pair.split_once('=')?;
            Some((name.to_string(), value.to_string()))
        })
        .collect()
}

/// `(user_id, password prefix)` when both cookies are present and plausible.
pub fn parse_auth_cookies(header: Option<&str>, user_cookie: &str, pass_cookie: &str) -> Option<(i64, String)> {
    let cookies = parse_cookies(header?);
    let user_id = cookies
        .get(user_cookie)?
        .parse::<i64>()
        .ok()
        .filter(|id| *id > 0)?;
    let pass = cookies.get(pass_cookie)?;
    if pass.chars().count() < MIN_PASS_PREFIX {
        return None;
    }
    Some((user_id, pass.clone()))
}

pub fn looks_like_bot(user_agent: Option<&str>) -> bool {
    user_agent.is_some_and(|ua| ua.to_ascii_lowercase().contains("bot"))
}

pub struct IdentityResolver {
    user_cookie: String,
    pass_cookie: String,
}

impl IdentityResolver {
    pub fn new(cfg: &ServerConfig) -> Self {
        Self {
            user_cookie: cfg.user_cookie.clone(),
            pass_cookie: cfg.pass_cookie.clone(),
        }
    }

    /// Anonymous visitors resolve to `Ok(None)`; only database faults are errors.
    pub async fn resolve(&self, ctx: &mut RequestContext) -> ForumResult<Option<Identity>> {
        let RequestContext { lease, req, ip, .. } = ctx;
        self.resolve_parts(lease, req, ip).await
    }

    async fn resolve_parts(
        &self,
        lease: &mut ConnectionLease,
        req: &ForumRequest,
        ip: &str,
    ) -> ForumResult<Option<Identity>> {
        let Some((user_id, pass)) =
            parse_auth_cookies(req.header("cookie"), &self.user_cookie, &self.pass_cookie)
        else {
            record_lurker(lease, req, ip).await?;
            return Ok(None);
        };

        let row = lease
            .single_row(USER_SQL, &[Value::Int(user_id), Value::Text(pass)])
            .await?;
        let Some(user) = row.as_ref().and_then(User::from_row) else {
            debug!(ip, user_id, "auth cookies did not match a user");
            record_lurker(lease, req, ip).await?;
            return Ok(None);
        };

        let blocks_others = load_relationships(lease, MY_POV_SQL, user.user_id, |r| r.other_id).await?;
        let blocked_by_others = load_relationships(lease, OTHER_POV_SQL, user.user_id, |r| r.self_id).await?;

        lease.query(PRUNE_ONLINES_SQL, &[]).await?;
        lease
            .query(
                TOUCH_ONLINE_SQL,
                &[Value::Int(user.user_id), Value::from(user.user_name.as_str())],
            )
            .await?;

        Ok(Some(Identity {
            user,
            blocks_others,
            blocked_by_others,
        }))
    }
}

async fn load_relationships(
    lease: &mut ConnectionLease,
    sql: &str,
    user_id: i64,
    key: impl Fn(&Relationship) -> i64,
) -> ForumResult<HashMap<i64, Relationship>> {
    Ok(lease
        .query(sql, &[Value::Int(user_id)])
        .await?
        .iter()
        .filter_map(Relationship::from_row)
        .map(|rel| (key(&rel), rel))
        .collect())
}

async fn record_lurker(lease: &mut ConnectionLease, req: &ForumRequest, ip: &str) -> ForumResult<()> {
    if looks_like_bot(req.header("user-agent")) {
        return Ok(());
    }
    lease.query(PRUNE_LURKERS_SQL, &[]).await?;
    let name = if ip.is_empty() { "null ip" } else { ip };
    lease.query(TOUCH_LURKER_SQL, &[Value::from(name)]).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::test_context;
    use crate::db::fake::FakePool;

    fn with_cookie(cookie: &str) -> ForumRequest {
        ForumRequest {
            method: "GET".into(),
            path: "/".into(),
            headers: vec![
                ("Cookie".into(), cookie.into()),
                ("User-Agent".into(), "Mozilla/5.0".into()),
            ],
            ..Default::default()
        }
    }

    fn rel(self_id: i64, other_id: i64, ban: i64, follow: i64, name: &str) -> Row {
        Row::new()
            .with("rel_self_id", self_id)
            .with("rel_other_id", other_id)
            .with("rel_my_friend", 0)
            .with("rel_i_ban", ban)
            .with("rel_i_follow", follow)
            .with("user_name", name)
    }

    fn scripted_pool() -> FakePool {
        let pool = FakePool::new();
        pool.on_with("from users", |params| {
            if params == [Value::Int(7), Value::Text("abcdef12".into())] {
                Ok(vec![Row::new()
                    .with("user_id", 7)
                    .with("user_name", "ann")
                    .with("user_email", "ann@example.com")
                    .with("user_level", 1)
                    .with("user_comments", 12)])
            } else {
                Ok(Vec::new())
            }
        });
        pool.on(
            "where rel_self_id",
            vec![rel(7, 9, 1_700_000_000, 0, "bob"), rel(7, 11, 0, 1_700_000_001, "cat")],
        );
        pool.on("where rel_other_id", vec![rel(13, 7, 1_700_000_002, 0, "dan")]);
        pool
    }

    #[test]
    fn cookie_pair_parsing() {
        assert_eq!(
            parse_auth_cookies(Some("patnetuser=7; patnetpass=abcdef12"), "patnetuser", "patnetpass"),
            Some((7, "abcdef12".to_string()))
        );
        assert_eq!(parse_auth_cookies(None, "patnetuser", "patnetpass"), None);
        assert_eq!(
            parse_auth_cookies(Some("patnetuser=7"), "patnetuser", "patnetpass"),
            None
        );
        assert_eq!(
            parse_auth_cookies(Some("patnetuser=7; patnetpass=short"), "patnetuser", "patnetpass"),
            None
        );
        assert_eq!(
            parse_auth_cookies(Some("patnetuser=x; patnetpass=abcdef12"), "patnetuser", "patnetpass"),
            None
        );
    }

    #[test]
    fn bots_are_recognized() {
        assert!(looks_like_bot(Some("Googlebot/2.1")));
        assert!(looks_like_bot(Some("Mozilla/5.0 (compatible; bingbot/2.0)")));
        assert!(!looks_like_bot(Some("Mozilla/5.0")));
        assert!(!looks_like_bot(None));
    }

    #[tokio::test]
    async fn anonymous_visitor_is_counted_as_lurker() {
        let pool = FakePool::new();
        let mut ctx = test_context(with_cookie(""), &pool).await;
        let resolver = IdentityResolver::new(&ServerConfig::default());

        assert_eq!(resolver.resolve(&mut ctx).await.unwrap(), None);
        assert_eq!(pool.hits("into lurkers"), 1);
        assert_eq!(pool.params_of("into lurkers")[0], vec![Value::from("10.9.8.7")]);
        assert_eq!(pool.hits("from users"), 0);
    }

    #[tokio::test]
    async fn crawlers_are_not_lurkers() {
        let pool = FakePool::new();
        let req = ForumRequest {
            headers: vec![("user-agent".into(), "Googlebot/2.1".into())],
            ..Default::default()
        };
        let mut ctx = test_context(req, &pool).await;
        let resolver = IdentityResolver::new(&ServerConfig::default());

        assert_eq!(resolver.resolve(&mut ctx).await.unwrap(), None);
        assert_eq!(pool.executed(), 0);
    }

    #[tokio::test]
    async fn wrong_password_is_anonymous() {
        let pool = scripted_pool();
        let mut ctx = test_context(with_cookie("patnetuser=7; patnetpass=zzzzzzzz"), &pool).await;
        let resolver = IdentityResolver::new(&ServerConfig::default());

        assert_eq!(resolver.resolve(&mut ctx).await.unwrap(), None);
        assert_eq!(pool.hits("from users"), 1);
        assert_eq!(pool.hits("into lurkers"), 1);
        assert_eq!(pool.hits("from relationships"), 0);
    }

    #[tokio::test]
    async fn valid_cookies_load_both_sides_of_the_graph() {
        let pool = scripted_pool();
        let mut ctx = test_context(with_cookie("patnetuser=7; patnetpass=abcdef12"), &pool).await;
        let resolver = IdentityResolver::new(&ServerConfig::default());

        let me = resolver.resolve(&mut ctx).await.unwrap().expect("identity");
        assert_eq!(me.user.user_name, "ann");
        assert!(me.ignores(9));
        assert!(!me.ignores(11));
        assert!(me.follows(11));
        assert!(me.ignored_by(13));
        assert!(me.hidden_from(13));
        assert!(!me.hidden_from(42));
        assert_eq!(
            me.blocked_by_others.get(&13).and_then(|r| r.other_name.as_deref()),
            Some("dan")
        );

        assert_eq!(pool.hits("delete from onlines"), 1);
        assert_eq!(
            pool.params_of("into onlines")[0],
            vec![Value::Int(7), Value::from("ann")]
        );
        assert_eq!(pool.hits("into lurkers"), 0);
    }

    #[tokio::test]
    async fn resolving_twice_gives_the_same_graph() {
        let pool = scripted_pool();
        let mut ctx = test_context(with_cookie("patnetuser=7; patnetpass=abcdef12"), &pool).await;
        let resolver = IdentityResolver::new(&ServerConfig::default());

        let first = resolver.resolve(&mut ctx).await.unwrap().expect("identity");
        let second = resolver.resolve(&mut ctx).await.unwrap().expect("identity");
        assert_eq!(first, second);
        assert!(ctx.current_user.is_none(), "resolve does not write into the context");
    }
}
