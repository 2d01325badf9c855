/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - PATNET Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

//! Request lifecycle core of the forum: per-address connection admission, abuse
//! filters, cookie identity and the dispatcher that ties them together.

pub mod abuse;
pub mod admission;
pub mod config;
pub mod context;
pub mod db;
pub mod dispatch;
pub mod error;
pub mod form;
pub mod handlers;
pub mod identity;
pub mod nonce;
pub mod paging;
pub mod permissions;
pub mod query;
pub mod response;
