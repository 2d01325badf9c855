/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - PATNET Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

//! Per-request control flow: admit, filter, authenticate, route, release.

use std::any::Any;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::FutureExt;
use patnet_protocol::{ForumRequest, ForumResponse, JsonEnvelope};
use tracing::{debug, error, info};

use crate::abuse::AbuseFilters;
use crate::admission::AdmissionGate;
use crate::config::ServerConfig;
use crate::context::{load_admin_email, now_ms, page_name, HeaderData, RequestContext, Site};
use crate::db::ConnectionPool;
use crate::error::{ForumError, ForumResult};
use crate::identity::IdentityResolver;
use crate::response;

#[async_trait]
pub trait Handler: Send + Sync {
    async fn handle(&self, ctx: &mut RequestContext) -> ForumResult<ForumResponse>;
}

/// Flat `(METHOD, page)` lookup.
#[derive(Default)]
pub struct Routes {
    table: HashMap<(String, String), Arc<dyn Handler>>,
}

impl Routes {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn route(mut self, method: &str, page: &str, handler: impl Handler + 'static) -> Self {
        self.table.insert(
            (method.to_ascii_uppercase(), page.to_string()),
            Arc::new(handler),
        );
        self
    }

    pub fn get(self, page: &str, handler: impl Handler + 'static) -> Self {
        self.route("GET", page, handler)
    }

    pub fn post(self, page: &str, handler: impl Handler + 'static) -> Self {
        self.route("POST", page, handler)
    }

    pub fn find(&self, method: &str, page: &str) -> Option<Arc<dyn Handler>> {
        self.table
            .get(&(method.to_ascii_uppercase(), page.to_string()))
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }
}

pub struct Dispatcher {
    gate: AdmissionGate,
    filters: AbuseFilters,
    resolver: IdentityResolver,
    site: Arc<Site>,
    routes: Routes,
}

impl Dispatcher {
    /// Fresh gate and filters over `pool`.
    pub fn new(pool: Arc<dyn ConnectionPool>, cfg: ServerConfig, routes: Routes) -> Self {
        let gate = AdmissionGate::new(pool, cfg.lease_max_hold());
        Self::with_state(gate, AbuseFilters::new(), cfg, routes)
    }

    /// Gate and filters are created by the caller and live as long as the dispatcher.
    pub fn with_state(gate: AdmissionGate, filters: AbuseFilters, cfg: ServerConfig, routes: Routes) -> Self {
        Self {
            gate,
            filters,
            resolver: IdentityResolver::new(&cfg),
            site: Arc::new(Site::new(cfg)),
            routes,
        }
    }

    pub fn gate(&self) -> &AdmissionGate {
        &self.gate
    }

    pub fn filters(&self) -> &AbuseFilters {
        &self.filters
    }

    pub fn site(&self) -> &Arc<Site> {
        &self.site
    }

    pub async fn dispatch(&self, req: ForumRequest) -> ForumResponse {
        let start_time = now_ms();
        let ip = req.remote_addr.clone();
        let page = page_name(&req.path);

        let Some(handler) = self.routes.find(&req.method, &page) else {
            debug!(ip = %ip, method = %req.method, page = %page, "no route");
            return response::rejection(404, &ForumError::NotFound(page).to_string());
        };
        if req.body.len() > self.site.cfg.max_body_bytes {
            return self.reject(&ip, &req, ForumError::PayloadTooLarge);
        }

        let mut lease = match self.gate.acquire(&ip).await {
            Ok(lease) => lease,
            Err(err) => return self.reject(&ip, &req, err),
        };

        let screened = async {
            if self.filters.ip_banned(&mut lease, &ip).await? {
                return Err(ForumError::Forbidden("user ip address blocked".into()));
            }
            if self.filters.country_blocked(&mut lease, &ip).await? {
                return Err(ForumError::Forbidden("country blocked".into()));
            }
            Ok::<(), ForumError>(())
        }
        .await;
        if let Err(err) = screened {
            drop(lease);
            return self.reject(&ip, &req, err);
        }

        let mut ctx = RequestContext::new(ip, page, req, start_time, lease, self.site.clone());
        let outcome = AssertUnwindSafe(self.run(handler.as_ref(), &mut ctx))
            .catch_unwind()
            .await;
        let resp = match outcome {
            Ok(Ok(resp)) => resp,
            Ok(Err(err)) => self.fail(&ctx, err),
            Err(panic) => self.fail(&ctx, ForumError::Internal(panic_message(panic.as_ref()))),
        };

        debug!(
            ip = %ctx.ip,
            page = %ctx.page,
            status = resp.status,
            queries = ctx.lease.query_log().len(),
            elapsed_ms = now_ms() - ctx.start_time,
            "request done"
        );
        // Dropping the context drops the lease: connection back to the pool, claim freed.
        drop(ctx);
        resp
    }

    async fn run(&self, handler: &dyn Handler, ctx: &mut RequestContext) -> ForumResult<ForumResponse> {
        ctx.current_user = self.resolver.resolve(ctx).await?;
        ctx.header_data = HeaderData::load(&mut ctx.lease).await?;
        ctx.admin_email = load_admin_email(&mut ctx.lease).await?;
        handler.handle(ctx).await
    }

    /// Rejections that happen before a context exists get a bare status and message.
    fn reject(&self, ip: &str, req: &ForumRequest, err: ForumError) -> ForumResponse {
        if err.is_fault() {
            error!(ip, url = %req.url(), "request failed: {err}");
        } else {
            info!(ip, url = %req.url(), status = err.status().as_u16(), "request rejected: {err}");
        }
        response::rejection(err.status().as_u16(), &err.to_string())
    }

    fn fail(&self, ctx: &RequestContext, err: ForumError) -> ForumResponse {
        let status = err.status().as_u16();
        if err.is_fault() {
            error!(ip = %ctx.ip, url = %ctx.req.url(), status, "request failed: {err}");
        } else {
            info!(ip = %ctx.ip, url = %ctx.req.url(), status, "request refused: {err}");
        }
        if ctx.has_param("ajax") {
            response::json(status, &JsonEnvelope::err(err.to_string()))
        } else {
            response::error_page(ctx, status, &err.to_string())
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "handler panicked".to_string()
    }
}
