/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - PATNET Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use chrono::{DateTime, Duration, Utc};

use crate::error::{ForumError, ForumResult};
use crate::identity::User;

pub const ADMIN_LEVEL: i64 = 4;
pub const MODERATOR_LEVEL: i64 = 3;

const MIN_COMMENTS_TO_POST: i64 = 3;

#[derive(Debug, Clone, Copy)]
pub struct CommentRef {
    pub author_id: i64,
    pub date: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy)]
pub struct PostRef {
    pub author_id: i64,
    pub date: DateTime<Utc>,
    pub approved: bool,
}

fn over_a_week_old(date: DateTime<Utc>, now: DateTime<Utc>) -> bool {
    date < now - Duration::weeks(1)
}

pub fn may_create_post(user: Option<&User>, min_level: i64) -> bool {
    user.is_some_and(|u| u.user_comments >= MIN_COMMENTS_TO_POST && u.user_level >= min_level)
}

pub fn may_delete_comment(user: Option<&User>, comment: &CommentRef, now: DateTime<Utc>) -> bool {
    let Some(u) = user else { return false };
    if u.user_level == ADMIN_LEVEL {
        return true;
    }
    !over_a_week_old(comment.date, now) && u.user_id == comment.author_id
}

pub fn may_delete_post(user: Option<&User>, post: &PostRef, now: DateTime<Utc>) -> bool {
    let Some(u) = user else { return false };
    if u.user_level == ADMIN_LEVEL {
        return true;
    }
    if over_a_week_old(post.date, now) {
        return false;
    }
    u.user_id == post.author_id || (u.user_level == MODERATOR_LEVEL && !post.approved)
}

pub fn may_mark_nsfw(user: Option<&User>) -> bool {
    user.is_some_and(|u| u.user_level >= 2)
}

pub fn may_flag(user: Option<&User>) -> bool {
    user.is_some_and(|u| u.user_level >= 2)
}

/// Turns a failed check into a 403.
pub fn require(allowed: bool, action: &str) -> ForumResult<()> {
    if allowed {
        Ok(())
    } else {
        Err(ForumError::Forbidden(format!("permission denied to {action}")))
    }
}
