/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - PATNET Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

//! Offset arithmetic for comment windows and post listings.

use crate::context::intval;

pub const COMMENTS_PER_PAGE: i64 = 40;
pub const POSTS_PER_PAGE: i64 = 20;

/// Highest page whose offset still fits in an `i64`.
const MAX_POST_PAGE: i64 = i64::MAX / POSTS_PER_PAGE;

/// Where a "next" link should land.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Anchor {
    /// Top of the comment list.
    Comments,
    /// The row at this index of the current window; used when consecutive windows overlap.
    Row(usize),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NextPage {
    pub offset: i64,
    pub anchor: Anchor,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageWindow {
    pub offset: i64,
    pub page_size: i64,
    pub first: Option<i64>,
    pub prev: Option<i64>,
    pub next: Option<NextPage>,
    pub last: i64,
}

impl PageWindow {
    pub fn has_first(&self) -> bool {
        self.first.is_some()
    }

    pub fn has_prev(&self) -> bool {
        self.prev.is_some()
    }

    pub fn has_next(&self) -> bool {
        self.next.is_some()
    }

    /// There is always a last page, even when it is this one.
    pub fn has_last(&self) -> bool {
        true
    }

    /// `(limit, offset)` for the SQL statement.
    pub fn limit_offset(&self) -> (i64, i64) {
        (self.page_size, self.offset)
    }
}

/// Window over `total` rows. No requested offset means the newest rows, i.e. the last page.
pub fn window(total: i64, requested: Option<i64>, page_size: i64) -> PageWindow {
    let page_size = page_size.max(1);
    let total = total.max(0);
    let last = (total - page_size).max(0);

    match requested {
        None => {
            let offset = last;
            let at_start = offset == 0;
            PageWindow {
                offset,
                page_size,
                first: (!at_start).then_some(0),
                prev: (!at_start).then_some((total - 2 * page_size).max(0)),
                next: None,
                last,
            }
        }
        Some(requested) => {
            let offset = requested.max(0);
            let at_start = offset == 0;
            let next = (offset < total - page_size).then(|| NextPage {
                // The final page is always full.
                offset: (offset + page_size).min(total - page_size),
                anchor: if total > page_size && total < 2 * page_size {
                    Anchor::Row((page_size - 1) as usize)
                } else {
                    Anchor::Comments
                },
            });
            PageWindow {
                offset,
                page_size,
                first: (!at_start).then_some(0),
                prev: (!at_start).then_some((offset - page_size).max(0)),
                next,
                last,
            }
        }
    }
}

/// Start of the page holding the row that has `rows_before` rows ahead of it.
pub fn offset_containing(rows_before: i64, page_size: i64) -> i64 {
    let page_size = page_size.max(1);
    (rows_before.max(0) / page_size) * page_size
}

/// `path?query#fragment` with `offset=` replaced, or appended when absent.
pub fn offset_link(path: &str, query: &str, offset: i64, fragment: &str) -> String {
    let mut replaced = false;
    let mut pairs: Vec<String> = query
        .split('&')
        .filter(|p| !p.is_empty())
        .map(|p| {
            if p == "offset" || p.starts_with("offset=") {
                replaced = true;
                format!("offset={offset}")
            } else {
                p.to_string()
            }
        })
        .collect();
    if !replaced {
        pairs.push(format!("offset={offset}"));
    }
    format!("{path}?{}#{fragment}", pairs.join("&"))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PostOrder {
    Active,
    Comments,
    Likes,
    New,
}

impl PostOrder {
    /// Unknown names fall back to `active`.
    pub fn parse(name: &str) -> Self {
        match name {
            "comments" => Self::Comments,
            "likes" => Self::Likes,
            "new" => Self::New,
            _ => Self::Active,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Comments => "comments",
            Self::Likes => "likes",
            Self::New => "new",
        }
    }

    pub fn order_by(&self) -> &'static str {
        match self {
            Self::Active => "order by post_modified desc",
            Self::Comments => "order by post_comments desc",
            Self::Likes => "order by (post_likes - post_dislikes) desc",
            Self::New => "order by post_date desc",
        }
    }
}

/// Which page of a post listing was asked for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PostPage {
    pub page: i64,
    pub order: PostOrder,
}

impl PostPage {
    pub fn select(page: &str, order: &str) -> Self {
        Self {
            page: intval(page).clamp(1, MAX_POST_PAGE),
            order: PostOrder::parse(order),
        }
    }

    pub fn offset(&self) -> i64 {
        (self.page - 1) * POSTS_PER_PAGE
    }

    /// `limit .. offset ..` clause; the ORDER BY column only ever comes from the whitelist.
    pub fn sql_tail(&self) -> String {
        format!(
            "{} limit {} offset {}",
            self.order.order_by(),
            POSTS_PER_PAGE,
            self.offset()
        )
    }

    pub fn page_count(total: i64) -> i64 {
        ((total.max(0) + POSTS_PER_PAGE - 1) / POSTS_PER_PAGE).max(1)
    }
}
