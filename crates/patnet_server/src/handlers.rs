/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - PATNET Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

//! Built-in pages. Everything here runs with a fully populated context.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use patnet_protocol::{ForumResponse, JsonEnvelope};
use sha2::{Digest, Sha256};
use tracing::info;

use crate::context::{intval, now_ms, segments, RequestContext};
use crate::db::{Row, Value};
use crate::dispatch::{Handler, Routes};
use crate::error::{ForumError, ForumResult};
use crate::form::collect_post_data;
use crate::paging::{offset_containing, offset_link, window, Anchor, PostPage, COMMENTS_PER_PAGE};
use crate::permissions::{may_create_post, may_delete_comment, require, CommentRef};
use crate::query::Statement;
use crate::response::{self, escape_html};

pub fn routes() -> Routes {
    Routes::new()
        .get("home", Home)
        .get("about", About)
        .get("logout", Logout)
        .get("ignore", Ignore)
        .get("follow_user", FollowUser)
        .get("post", ShowPost)
        .get("delete_comment", DeleteComment)
        .post("login", Login)
}

const HOME_POSTS_SQL: &str = "select post_id, post_title, post_comments, post_author, user_name from posts \
     left join users on user_id = post_author \
     where post_approved = 1 and post_modified > now() - interval '7 days'";
const HOME_COUNT_SQL: &str = "select count(*) as c from posts \
     where post_approved = 1 and post_modified > now() - interval '7 days'";

const POST_SQL: &str = "select post_id, post_title, post_content, post_author, post_date, user_name from posts \
     left join users on user_id = post_author where post_id = $1";
const COMMENT_COUNT_SQL: &str = "select count(*) as c from comments where comment_post_id = $1";
const COMMENTS_BEFORE_SQL: &str =
    "select count(*) as c from comments where comment_post_id = $1 and comment_id < $2";
const COMMENTS_SQL: &str = "select comment_id, comment_author, comment_content, comment_date, user_name from comments \
     left join users on user_id = comment_author \
     where comment_post_id = $1 order by comment_id limit $2 offset $3";

pub struct Home;

#[async_trait]
impl Handler for Home {
    async fn handle(&self, ctx: &mut RequestContext) -> ForumResult<ForumResponse> {
        // Legacy links look like /?p=1216301.
        let p = ctx.int_param("p");
        if p > 0 {
            return Ok(response::redirect(&format!("/post/{p}"), 301));
        }

        let which = PostPage::select(&ctx.param("page"), &ctx.param("order"));
        let sql = format!("{HOME_POSTS_SQL} {}", which.sql_tail());
        let set = ctx
            .lease
            .execute(&Statement::new(&sql).with_total(HOME_COUNT_SQL, Vec::new()))
            .await?;

        let mut out = String::new();
        if may_create_post(ctx.current_user.as_ref().map(|me| &me.user), 1) {
            out.push_str("<a href='/new_post'>new post</a><br>\n");
        }
        for row in &set.rows {
            let author = row.get_i64("post_author").unwrap_or(0);
            if ctx.current_user.as_ref().is_some_and(|me| me.ignores(author)) {
                continue;
            }
            out.push_str(&format!(
                "<div class='post'><a href='/post/{}'>{}</a> by {} ({} comments)</div>\n",
                row.get_i64("post_id").unwrap_or(0),
                escape_html(row.get_str("post_title").unwrap_or_default()),
                escape_html(row.get_str("user_name").unwrap_or("anonymous")),
                row.get_i64("post_comments").unwrap_or(0),
            ));
        }

        let pages = PostPage::page_count(set.total_rows.unwrap_or(0));
        let order = which.order.as_str();
        if which.page > 1 {
            out.push_str(&format!("<a href='/?page={}&order={order}'>&laquo; previous</a> ", which.page - 1));
        }
        if which.page < pages {
            out.push_str(&format!("<a href='/?page={}&order={order}'>next &raquo;</a>", which.page + 1));
        }

        Ok(response::html(200, response::page(ctx, "home", &out)))
    }
}

pub struct About;

#[async_trait]
impl Handler for About {
    async fn handle(&self, ctx: &mut RequestContext) -> ForumResult<ForumResponse> {
        Ok(response::redirect(&format!("/post/{}", ctx.site.cfg.about_post_id), 303))
    }
}

pub struct Logout;

#[async_trait]
impl Handler for Logout {
    async fn handle(&self, ctx: &mut RequestContext) -> ForumResult<ForumResponse> {
        let mut resp = response::redirect("/", 303);
        resp.headers.extend(response::logout_cookies(&ctx.site.cfg));
        Ok(resp)
    }
}

/// Which relationship flag a toggle flips, and the user counter it feeds.
#[derive(Clone, Copy)]
enum Edge {
    Ban,
    Follow,
}

impl Edge {
    fn upsert_sql(self) -> &'static str {
        match self {
            Edge::Ban => {
                "insert into relationships (rel_self_id, rel_other_id, rel_i_ban) values ($1, $2, $3) \
                 on conflict (rel_self_id, rel_other_id) do update set rel_i_ban = excluded.rel_i_ban"
            }
            Edge::Follow => {
                "insert into relationships (rel_self_id, rel_other_id, rel_i_follow) values ($1, $2, $3) \
                 on conflict (rel_self_id, rel_other_id) do update set rel_i_follow = excluded.rel_i_follow"
            }
        }
    }

    fn recount_sql(self) -> &'static str {
        match self {
            Edge::Ban => {
                "update users set user_bannedby = \
                 (select count(*) from relationships where rel_i_ban > 0 and rel_other_id = $1) where user_id = $1"
            }
            Edge::Follow => {
                "update users set user_followers = \
                 (select count(*) from relationships where rel_i_follow > 0 and rel_other_id = $1) where user_id = $1"
            }
        }
    }

    fn done(self, undo: bool) -> &'static str {
        match (self, undo) {
            (Edge::Ban, false) => "User ignored",
            (Edge::Ban, true) => "User unignored",
            (Edge::Follow, _) => "Follow status updated",
        }
    }
}

/// Ajax callers get a JSON envelope, everyone else a page.
fn reply(ctx: &RequestContext, ok: bool, message: &str) -> ForumResponse {
    if ctx.has_param("ajax") {
        let envelope = if ok {
            JsonEnvelope::ok(message)
        } else {
            JsonEnvelope::err(message)
        };
        response::json(200, &envelope)
    } else {
        response::die(ctx, message)
    }
}

async fn toggle(ctx: &mut RequestContext, edge: Edge) -> ForumResult<ForumResponse> {
    let other_id = ctx.int_param("other_id");
    if other_id <= 0 {
        return Ok(reply(ctx, false, "other_id missing"));
    }
    let Some(me) = ctx.user_id() else {
        return Ok(reply(ctx, false, "must be logged in to do that"));
    };
    if !ctx.nonce_valid() {
        return Ok(reply(ctx, false, "Form expired. Please reload the page and try again."));
    }

    let undo = intval(&ctx.param("undo")) != 0;
    let since = if undo { 0 } else { now_ms() / 1000 };
    ctx.lease
        .query(edge.upsert_sql(), &[Value::Int(me), Value::Int(other_id), Value::Int(since)])
        .await?;
    ctx.lease.query(edge.recount_sql(), &[Value::Int(other_id)]).await?;
    Ok(reply(ctx, true, edge.done(undo)))
}

pub struct Ignore;

#[async_trait]
impl Handler for Ignore {
    async fn handle(&self, ctx: &mut RequestContext) -> ForumResult<ForumResponse> {
        toggle(ctx, Edge::Ban).await
    }
}

pub struct FollowUser;

#[async_trait]
impl Handler for FollowUser {
    async fn handle(&self, ctx: &mut RequestContext) -> ForumResult<ForumResponse> {
        toggle(ctx, Edge::Follow).await
    }
}

/// Parses the two shapes timestamps come back from the store in.
fn parse_db_time(text: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(text)
        .map(|t| t.with_timezone(&Utc))
        .ok()
        .or_else(|| {
            NaiveDateTime::parse_from_str(text, "%Y-%m-%d %H:%M:%S%.f")
                .ok()
                .map(|t| t.and_utc())
        })
}

fn comment_ref(row: &Row) -> CommentRef {
    CommentRef {
        author_id: row.get_i64("comment_author").unwrap_or(0),
        date: row
            .get_str("comment_date")
            .and_then(parse_db_time)
            .unwrap_or(DateTime::<Utc>::MIN_UTC),
    }
}

pub struct ShowPost;

#[async_trait]
impl Handler for ShowPost {
    async fn handle(&self, ctx: &mut RequestContext) -> ForumResult<ForumResponse> {
        let post_id = segments(&ctx.req.path)
            .get(2)
            .map(|s| intval(s))
            .unwrap_or(0);
        if post_id <= 0 {
            return Err(ForumError::NotFound("post".into()));
        }
        let Some(post) = ctx.lease.single_row(POST_SQL, &[Value::Int(post_id)]).await? else {
            return Err(ForumError::NotFound(format!("post {post_id}")));
        };

        let total = ctx
            .lease
            .scalar(COMMENT_COUNT_SQL, &[Value::Int(post_id)])
            .await?
            .and_then(|v| v.as_i64())
            .unwrap_or(0);

        // A comment permalink (?c=123) opens the page that holds it.
        let requested = if ctx.has_param("c") {
            let before = ctx
                .lease
                .scalar(
                    COMMENTS_BEFORE_SQL,
                    &[Value::Int(post_id), Value::Int(ctx.int_param("c"))],
                )
                .await?
                .and_then(|v| v.as_i64())
                .unwrap_or(0);
            Some(offset_containing(before, COMMENTS_PER_PAGE))
        } else if ctx.has_param("offset") {
            Some(ctx.int_param("offset"))
        } else {
            None
        };
        let win = window(total, requested, COMMENTS_PER_PAGE);
        let (limit, offset) = win.limit_offset();
        let comments = ctx
            .lease
            .query(
                COMMENTS_SQL,
                &[Value::Int(post_id), Value::Int(limit), Value::Int(offset)],
            )
            .await?;

        let title = post.get_str("post_title").unwrap_or_default().to_string();
        let mut out = format!(
            "<h1>{}</h1>\n<div class='byline'>by {}</div>\n<div class='post-content'>{}</div>\n<p id='comments'></p>\n",
            escape_html(&title),
            escape_html(post.get_str("user_name").unwrap_or("anonymous")),
            escape_html(post.get_str("post_content").unwrap_or_default()),
        );

        let now = Utc::now();
        let nonce = ctx.nonce_params();
        let me = ctx.current_user.as_ref();
        for row in &comments {
            let id = row.get_i64("comment_id").unwrap_or(0);
            let author = row.get_i64("comment_author").unwrap_or(0);
            let hide = if me.is_some_and(|me| me.hidden_from(author)) {
                " style='display: none'"
            } else {
                ""
            };
            out.push_str(&format!(
                "<div class='comment' id='comment-{id}'{hide}><b>{}</b> {}",
                escape_html(row.get_str("user_name").unwrap_or("anonymous")),
                escape_html(row.get_str("comment_content").unwrap_or_default()),
            ));
            if me.is_some_and(|me| me.user.user_id != author) {
                out.push_str(&format!(" <a href='/ignore?other_id={author}&{nonce}'>ignore</a>"));
            }
            if may_delete_comment(me.map(|me| &me.user), &comment_ref(row), now) {
                out.push_str(&format!(" <a href='/delete_comment?comment_id={id}&{nonce}'>delete</a>"));
            }
            out.push_str("</div>\n");
        }
        out.push_str("<p id='last'></p>\n");

        if total > COMMENTS_PER_PAGE {
            let path = &ctx.req.path;
            let query = &ctx.req.query;
            let link = |offset: i64, fragment: &str| escape_html(&offset_link(path, query, offset, fragment));
            let mut nav = Vec::new();
            if let Some(first) = win.first {
                nav.push(format!("<a href='{}'>&laquo; First</a>", link(first, "comments")));
            }
            if let Some(prev) = win.prev {
                nav.push(format!("<a href='{}'>&laquo; Previous</a>", link(prev, "comments")));
            }
            if let Some(next) = win.next {
                let fragment = match next.anchor {
                    Anchor::Row(i) => comments
                        .get(i)
                        .and_then(|r| r.get_i64("comment_id"))
                        .map(|id| format!("comment-{id}"))
                        .unwrap_or_else(|| "comments".to_string()),
                    Anchor::Comments => "comments".to_string(),
                };
                nav.push(format!("<a href='{}'>Next &raquo;</a>", link(next.offset, &fragment)));
            }
            nav.push(format!("<a href='{}'>Last &raquo;</a>", link(win.last, "last")));
            out.push_str(&format!("<p class='pagination'>{}</p>\n", nav.join(" &nbsp; ")));
        }

        Ok(response::html(200, response::page(ctx, &title, &out)))
    }
}

pub struct DeleteComment;

#[async_trait]
impl Handler for DeleteComment {
    async fn handle(&self, ctx: &mut RequestContext) -> ForumResult<ForumResponse> {
        let comment_id = ctx.int_param("comment_id");
        if !ctx.nonce_valid() {
            return Ok(reply(ctx, false, "Form expired. Please reload the page and try again."));
        }
        let Some(row) = ctx
            .lease
            .single_row(
                "select comment_id, comment_post_id, comment_author, comment_date from comments where comment_id = $1",
                &[Value::Int(comment_id)],
            )
            .await?
        else {
            return Err(ForumError::NotFound(format!("comment {comment_id}")));
        };
        let me = ctx.current_user.as_ref().map(|me| &me.user);
        require(may_delete_comment(me, &comment_ref(&row), Utc::now()), "delete that comment")?;

        let post_id = row.get_i64("comment_post_id").unwrap_or(0);
        ctx.lease
            .query("delete from comments where comment_id = $1", &[Value::Int(comment_id)])
            .await?;
        ctx.lease
            .query(
                "update posts set post_comments = \
                 (select count(*) from comments where comment_post_id = $1) where post_id = $1",
                &[Value::Int(post_id)],
            )
            .await?;
        Ok(response::redirect(&format!("/post/{post_id}"), 303))
    }
}

const LOGIN_SQL: &str = "select user_id, user_pass from users where user_email = $1 and user_pass = $2";

/// Stored form of a password.
pub fn password_hash(password: &str) -> String {
    hex::encode(Sha256::digest(password.as_bytes()))
}

pub struct Login;

#[async_trait]
impl Handler for Login {
    async fn handle(&self, ctx: &mut RequestContext) -> ForumResult<ForumResponse> {
        let max_body = ctx.site.cfg.max_body_bytes;
        let form = collect_post_data(ctx, max_body)?;
        let email = form.get("email").map(String::as_str).unwrap_or_default();
        let password = form.get("password").map(String::as_str).unwrap_or_default();
        if email.is_empty() || password.is_empty() {
            return Ok(response::die(ctx, "email and password are required"));
        }

        let row = ctx
            .lease
            .single_row(LOGIN_SQL, &[Value::from(email), Value::from(password_hash(password))])
            .await?;
        let Some((user_id, pass)) = row.and_then(|r| {
            Some((r.get_i64("user_id")?, r.get_str("user_pass")?.to_string()))
        }) else {
            info!(ip = %ctx.ip, "login failed");
            return Ok(response::die(ctx, "login failed"));
        };

        // Only same-site paths; anything else goes home.
        let goto = form
            .get("goto")
            .filter(|g| g.starts_with('/') && !g.starts_with("//"))
            .cloned()
            .unwrap_or_else(|| "/".to_string());
        let mut resp = response::redirect(&goto, 303);
        resp.headers.extend(response::login_cookies(&ctx.site.cfg, user_id, &pass));
        Ok(resp)
    }
}
