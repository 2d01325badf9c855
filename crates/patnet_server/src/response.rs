/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - PATNET Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use std::time::SystemTime;

use chrono::{Months, Utc};
use patnet_protocol::{ForumResponse, JsonEnvelope};

use crate::config::ServerConfig;
use crate::context::{now_ms, RequestContext};

pub const HTML_CONTENT_TYPE: &str = "text/html;charset=utf-8";

fn expires_now() -> String {
    httpdate::fmt_http_date(SystemTime::now())
}

pub fn html(status: u16, body: impl Into<String>) -> ForumResponse {
    ForumResponse::new(status, body)
        .with_header("Content-Type", HTML_CONTENT_TYPE)
        .with_header("Expires", expires_now())
}

pub fn json(status: u16, envelope: &JsonEnvelope) -> ForumResponse {
    let body = serde_json::to_string(envelope)
        .unwrap_or_else(|_| r#"{"err":true,"content":""}"#.to_string());
    ForumResponse::new(status, body)
        .with_header("Content-Type", "application/json;charset=utf-8")
        .with_header("Expires", expires_now())
}

/// 303 unless told otherwise; 301 for permanent moves.
pub fn redirect(to: &str, status: u16) -> ForumResponse {
    ForumResponse::new(status, format!("Redirecting to {to}"))
        .with_header("Location", to)
        .with_header("Expires", expires_now())
}

/// Bare status with a short text body, for requests rejected before a page can be built.
pub fn rejection(status: u16, message: &str) -> ForumResponse {
    ForumResponse::new(status, message.to_string())
        .with_header("Content-Type", "text/plain;charset=utf-8")
        .with_header("Expires", expires_now())
}

/// A full page whose only content is `message`. Status 200: the page itself rendered fine.
pub fn die(ctx: &RequestContext, message: &str) -> ForumResponse {
    html(200, page(ctx, message, &format!("<h2>{}</h2>", escape_html(message))))
}

/// Like [`die`] but carrying a non-2xx status.
pub fn error_page(ctx: &RequestContext, status: u16, message: &str) -> ForumResponse {
    html(status, page(ctx, message, &format!("<h2>{}</h2>", escape_html(message))))
}

/// The standard head/body/footer shell around `content`, which must already be safe HTML.
pub fn page(ctx: &RequestContext, title: &str, content: &str) -> String {
    let site = escape_html(&ctx.site.cfg.site_name);
    let hd = &ctx.header_data;
    let onlines = hd
        .onlines
        .iter()
        .map(|u| {
            let name = escape_html(&u.user_name);
            format!("<a href='/user/{name}'>{name}</a>")
        })
        .collect::<Vec<_>>()
        .join(", ");
    let and = if onlines.is_empty() { "" } else { " and" };
    let lurker_s = if hd.lurkers == 1 { "" } else { "s" };
    let whoami = match &ctx.current_user {
        Some(me) => format!(
            "{} <a href='/logout'>logout</a>",
            escape_html(&me.user.user_name)
        ),
        None => String::new(),
    };
    let footer = match &ctx.admin_email {
        Some(email) => {
            let email = escape_html(email);
            format!("<a href='mailto:{email}'>contact</a>")
        }
        None => String::new(),
    };

    format!(
        "<!DOCTYPE html>\n<html lang=\"en\">\n<head>\n<meta charset=\"utf-8\">\n\
         <meta name=\"viewport\" content=\"width=device-width, initial-scale=1\">\n\
         <title>{title} | {site}</title>\n</head>\n<body>\n\
         <div id='header'><a href='/'>{site}</a> {whoami}<br>\
         {comments} comments by {users} users, {onlines}{and} {lurkers} lurker{lurker_s} online now</div>\n\
         <div id='midpage'>{content}</div>\n\
         <div id='footer'>{footer}</div>\n</body>\n</html>\n{timings}",
        title = escape_html(title),
        comments = hd.comments,
        users = hd.users,
        lurkers = hd.lurkers,
        timings = timings(ctx),
    )
}

/// Query log as an HTML comment at the bottom of every page.
pub fn timings(ctx: &RequestContext) -> String {
    let log = ctx.lease.query_log();
    let mut out = format!(
        "<!-- {} queries, {:.1}ms db, {}ms total",
        log.len(),
        ctx.lease.total_query_ms(),
        now_ms() - ctx.start_time
    );
    for q in log {
        let sql = q.sql.split_whitespace().collect::<Vec<_>>().join(" ").replace("--", "- -");
        out.push_str(&format!("\n  {:.1}ms {sql}", q.elapsed_ms));
    }
    out.push_str(" -->\n");
    out
}

/// Both auth cookies, valid for ten years.
pub fn login_cookies(cfg: &ServerConfig, user_id: i64, pass: &str) -> Vec<(String, String)> {
    let now = Utc::now();
    let decade = now.checked_add_months(Months::new(120)).unwrap_or(now);
    let expires = decade.format("%a, %d %b %Y %H:%M:%S GMT");
    vec![
        (
            "Set-Cookie".to_string(),
            format!("{}={user_id}; Expires={expires}; Path=/", cfg.user_cookie),
        ),
        (
            "Set-Cookie".to_string(),
            format!("{}={pass}; Expires={expires}; Path=/", cfg.pass_cookie),
        ),
    ]
}

pub fn logout_cookies(cfg: &ServerConfig) -> Vec<(String, String)> {
    let gone = httpdate::fmt_http_date(SystemTime::UNIX_EPOCH);
    [&cfg.user_cookie, &cfg.pass_cookie]
        .into_iter()
        .map(|name| ("Set-Cookie".to_string(), format!("{name}=; Expires={gone}; Path=/")))
        .collect()
}

pub fn escape_html(text: &str) -> String {
    let mut out = String::with_capacity(text.len() + 16);
    for ch in text.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(ch),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::test_context;
    use crate::db::fake::FakePool;
    use patnet_protocol::ForumRequest;

    #[test]
    fn html_and_json_headers() {
        let r = html(200, "<p>hi</p>");
        assert_eq!(r.header("content-type"), Some(HTML_CONTENT_TYPE));
        assert!(r.header("expires").is_some());

        let r = json(200, &JsonEnvelope::err("nope"));
        assert_eq!(r.body, r#"{"err":true,"content":"nope"}"#);
    }

    #[test]
    fn redirects_carry_location() {
        let r = redirect("/post/1", 303);
        assert_eq!(r.status, 303);
        assert_eq!(r.header("location"), Some("/post/1"));
        assert_eq!(r.body, "Redirecting to /post/1");
    }

    #[test]
    fn cookies_set_and_expire() {
        let cfg = ServerConfig::default();
        let set = login_cookies(&cfg, 7, "abcdef12");
        assert_eq!(set.len(), 2);
        assert!(set[0].1.starts_with("patnetuser=7; Expires="));
        assert!(set[1].1.starts_with("patnetpass=abcdef12; Expires="));
        assert!(set[0].1.ends_with("GMT; Path=/"));

        let gone = logout_cookies(&cfg);
        assert_eq!(gone[0].1, "patnetuser=; Expires=Thu, 01 Jan 1970 00:00:00 GMT; Path=/");
    }

    #[test]
    fn escaping() {
        assert_eq!(escape_html("<a href='x'>&</a>"), "&lt;a href=&#39;x&#39;&gt;&amp;&lt;/a&gt;");
    }

    #[tokio::test]
    async fn die_renders_a_full_escaped_page() {
        let pool = FakePool::new();
        let mut ctx = test_context(ForumRequest::default(), &pool).await;
        ctx.lease.query("select 1", &[]).await.unwrap();
        ctx.admin_email = Some("admin@example.com".into());

        let r = die(&ctx, "bad <input>");
        assert_eq!(r.status, 200);
        assert!(r.body.starts_with("<!DOCTYPE html>"));
        assert!(r.body.contains("<h2>bad &lt;input&gt;</h2>"));
        assert!(r.body.contains("mailto:admin@example.com"));
        assert!(r.body.contains("<!-- 1 queries"));
        assert!(r.body.contains("select 1"));
    }
}
