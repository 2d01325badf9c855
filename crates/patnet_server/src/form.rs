/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - PATNET Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use std::collections::HashMap;

use crate::context::RequestContext;
use crate::error::{ForumError, ForumResult};

/// Decodes `a=1&b=two+words` pairs. Keys without `=` get an empty value.
pub fn parse_urlencoded(input: &str) -> Vec<(String, String)> {
    input
        .split('&')
        .filter(|pair| !pair.is_empty())
        .map(|pair| {
            let (k, v) = pair.split_once('=').unwrap_or((pair, ""));
            (decode_component(k), decode_component(v))
        })
        .collect()
}

fn decode_component(raw: &str) -> String {
    let spaced = raw.replace('+', " ");
    match urlencoding::decode(&spaced) {
        Ok(s) => s.into_owned(),
        Err(_) => spaced,
    }
}

/// The POSTed form of this request: trimmed values, `submit` dropped.
pub fn collect_post_data(ctx: &RequestContext, max_bytes: usize) -> ForumResult<HashMap<String, String>> {
    if !ctx.req.method.eq_ignore_ascii_case("POST") {
        return Err(ForumError::BadRequest(format!(
            "attempt to collect post data from {} by {}",
            ctx.req.method, ctx.ip
        )));
    }
    if ctx.req.body.len() > max_bytes {
        return Err(ForumError::PayloadTooLarge);
    }
    let mut out: HashMap<String, String> = parse_urlencoded(&ctx.req.body)
        .into_iter()
        .map(|(k, v)| (k, v.trim().to_string()))
        .collect();
    // Some browsers send the button as a field.
    out.remove("submit");
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::test_context;
    use patnet_protocol::ForumRequest;

    #[test]
    fn decodes_plus_and_percent() {
        let pairs = parse_urlencoded("title=hello+world&body=a%26b&flag&=x");
        assert_eq!(
            pairs,
            vec![
                ("title".to_string(), "hello world".to_string()),
                ("body".to_string(), "a&b".to_string()),
                ("flag".to_string(), String::new()),
                (String::new(), "x".to_string()),
            ]
        );
    }

    #[test]
    fn bad_escapes_are_kept_verbatim() {
        let pairs = parse_urlencoded("q=%zz");
        assert_eq!(pairs[0].1, "%zz");
    }

    #[tokio::test]
    async fn post_bodies_are_trimmed_and_capped() {
        let req = ForumRequest {
            method: "POST".into(),
            path: "/accept_comment".into(),
            body: "comment_content=++hi+there++&submit=Post".into(),
            ..Default::default()
        };
        let ctx = test_context(req, &crate::db::fake::FakePool::new()).await;
        let form = collect_post_data(&ctx, 1_000).unwrap();
        assert_eq!(form.get("comment_content").map(String::as_str), Some("hi there"));
        assert!(!form.contains_key("submit"));

        assert!(matches!(
            collect_post_data(&ctx, 10),
            Err(ForumError::PayloadTooLarge)
        ));
    }

    #[tokio::test]
    async fn get_requests_have_no_form() {
        let req = ForumRequest {
            method: "GET".into(),
            ..Default::default()
        };
        let ctx = test_context(req, &crate::db::fake::FakePool::new()).await;
        assert!(matches!(
            collect_post_data(&ctx, 1_000),
            Err(ForumError::BadRequest(_))
        ));
    }
}
