//! One HTTP exchange: request interception, the upstream round trip and
//! response capture.

use crate::api::events::{EventDispatcher, ProxyEvent};
use crate::models::{
    method_allows, BodySnapshot, BreakpointResolution, BreakpointRule, ConditionKind,
    ExchangeEdit, ExchangePhase, MockRule, PendingBreakpoint, RequestRecord, RewriteRule,
    RewriteTarget,
};
use crate::proxy::body::{self, BodyPromise, BodyTap, CapturedBody};
use crate::proxy::http1::{
    forward_body, header_value, read_body, reason_phrase, remove_header, resolve_target,
    respond_with_status, set_header, write_full_response, write_request_head,
    write_response_head, BodyFraming, BodyTooLarge, RequestHead, ResponseHead, Scheme, Target,
    WireReader,
};
use crate::proxy::rules::{
    applicable_rewrites, apply_rewrites, find_breakpoint, find_mock, map_remote_target,
    rewrites_touch_body, wildcard_match, HeaderOverrides, RequestFacts,
};
use crate::proxy::server::ProxyContext;
use crate::proxy::shaping::write_limited;
use crate::proxy::state::RuleSets;
use crate::proxy::websocket::{websocket_tunnel, WsSession};
use anyhow::anyhow;
use chrono::Utc;
use std::collections::HashMap;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use uuid::Uuid;

/// What the connection does after an exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    KeepAlive,
    Close,
}

pub(crate) fn header_map(headers: &[(String, String)]) -> HashMap<String, String> {
    headers.iter().cloned().collect()
}

/// Record under construction plus the guarantee of exactly one terminal
/// update, even when the exchange is abandoned midway.
pub(crate) struct Exchange {
    pub record: RequestRecord,
    events: EventDispatcher,
    request_body: Option<BodyPromise>,
    finished: bool,
}

impl Exchange {
    pub fn new(record: RequestRecord, events: EventDispatcher) -> Self {
        Self {
            record,
            events,
            request_body: None,
            finished: false,
        }
    }

    pub fn publish_partial(&self) {
        self.events
            .publish(ProxyEvent::Request(self.record.partial()));
    }

    /// Start analysing the request body; the terminal record picks it up.
    pub fn set_request_body(&mut self, body: CapturedBody) {
        self.request_body = Some(BodyPromise::spawn(body));
    }

    pub fn fail(&mut self, status: u16, error: impl Into<String>) {
        self.record.status_code = status;
        self.record.error = Some(error.into());
        self.finish(None);
    }

    /// Publish the terminal record once bodies are analysed. Later calls are no-ops.
    pub fn finish(&mut self, response: Option<CapturedBody>) {
        if self.finished {
            return;
        }
        self.finished = true;

        let mut record = self.record.clone();
        let request_body = self.request_body.take().unwrap_or_else(BodyPromise::empty);
        let events = self.events.clone();
        let task = async move {
            let request = request_body.resolve().await;
            record.request_body = request.text;
            record.request_body_raw = request.raw;
            if let Some(response) = response {
                let analysis = body::analyze_in_background(response).await;
                record.response_body = analysis.text;
                record.response_body_raw = analysis.raw;
            }
            events.publish(ProxyEvent::Request(record.into_terminal()));
        };

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(task);
            }
            Err(_) => tracing::warn!("No runtime to finalize exchange {}", self.record.id),
        }
    }
}

impl Drop for Exchange {
    fn drop(&mut self) {
        if !self.finished {
            self.record
                .error
                .get_or_insert_with(|| "connection closed before the exchange completed".into());
            self.finish(None);
        }
    }
}

fn captured(bytes: Vec<u8>, headers: &[(String, String)]) -> CapturedBody {
    CapturedBody {
        total_bytes: bytes.len() as u64,
        content_encoding: header_value(headers, "content-encoding").map(str::to_string),
        bytes,
        ..Default::default()
    }
}

fn has_body_condition(rule: &RewriteRule) -> bool {
    rule.conditions
        .iter()
        .any(|c| matches!(c.kind, ConditionKind::Body))
}

/// Whether some rule could need the request body in memory.
fn needs_request_body(rules: &RuleSets, method: &str, url: &str) -> bool {
    let mocks = rules.mocks.iter().any(|rule| {
        rule.enabled
            && rule.has_body_condition()
            && method_allows(&rule.method, method)
            && wildcard_match(url, &rule.url_pattern)
    });
    let rewrites = rules.rewrites.iter().any(|rule| {
        rule.enabled
            && method_allows(&rule.method, method)
            && wildcard_match(url, &rule.url_pattern)
            && (has_body_condition(rule)
                || (rule.phase.covers(ExchangePhase::Request)
                    && matches!(rule.target, RewriteTarget::Body)))
    });
    mocks
        || rewrites
        || find_breakpoint(&rules.breakpoints, ExchangePhase::Request, method, url).is_some()
}

/// Hop-by-hop connection headers for the response sent to the client.
fn set_connection_header(headers: &mut Vec<(String, String)>, reusable: bool) {
    remove_header(headers, "connection");
    remove_header(headers, "keep-alive");
    if !reusable {
        headers.push(("Connection".into(), "close".into()));
    }
}

fn status_forbids_body(status: u16) -> bool {
    (100..200).contains(&status) || status == 204 || status == 304
}

fn pending_breakpoint(
    rule: &BreakpointRule,
    record: &RequestRecord,
    phase: ExchangePhase,
    headers: &[(String, String)],
    request_body: BodySnapshot,
) -> PendingBreakpoint {
    PendingBreakpoint {
        id: Uuid::new_v4().to_string(),
        rule_id: rule.id.clone(),
        request_id: record.id.clone(),
        phase,
        method: record.method.clone(),
        url: record.url.clone(),
        request_headers: headers.to_vec(),
        request_body,
        status_code: None,
        response_headers: None,
        response_body: None,
        created_at: Utc::now().timestamp_millis(),
    }
}

async fn reject_request_body<C>(
    client: &mut WireReader<C>,
    exchange: &mut Exchange,
    err: anyhow::Error,
) -> anyhow::Result<Flow>
where
    C: AsyncRead + AsyncWrite + Unpin,
{
    let (code, label) = if err.downcast_ref::<BodyTooLarge>().is_some() {
        (413, "Payload Too Large")
    } else {
        (400, "Bad Request")
    };
    tracing::warn!("Failed to read request body: {err:#}");
    let _ = respond_with_status(client.get_mut(), code, label, "Failed to read request body").await;
    exchange.fail(code, format!("{err:#}"));
    Ok(Flow::Close)
}

async fn respond_with_mock<C>(
    client: &mut WireReader<C>,
    exchange: &mut Exchange,
    mock: MockRule,
    request_body: CapturedBody,
    keep_alive: bool,
) -> anyhow::Result<Flow>
where
    C: AsyncRead + AsyncWrite + Unpin,
{
    if mock.delay_ms > 0 {
        tokio::time::sleep(Duration::from_millis(mock.delay_ms)).await;
    }
    exchange.set_request_body(request_body);

    let body = mock.body.into_bytes();
    write_full_response(client.get_mut(), mock.status, &mock.headers, &body, !keep_alive).await?;
    tracing::info!(
        "Mock rule {} answered {} {}",
        mock.id,
        exchange.record.method,
        exchange.record.url
    );

    exchange.record.mocked = true;
    exchange.record.status_code = mock.status;
    exchange.record.response_headers = header_map(&mock.headers);
    exchange.record.content_length = body.len() as u64;
    exchange.finish(Some(captured(body, &mock.headers)));
    Ok(if keep_alive { Flow::KeepAlive } else { Flow::Close })
}

fn apply_request_edit(
    edit: ExchangeEdit,
    method: &mut String,
    url: &mut String,
    target: &mut Target,
    headers: &mut Vec<(String, String)>,
    body: &mut Option<Vec<u8>>,
) {
    if let Some(new_method) = edit.method {
        *method = new_method;
    }
    if let Some(new_headers) = edit.request_headers {
        *headers = new_headers;
    }
    if let Some(new_url) = edit.url {
        match Target::from_url(&new_url) {
            Ok(new_target) => {
                set_header(headers, "Host", new_target.authority());
                *target = new_target;
                *url = new_url;
            }
            Err(err) => tracing::warn!("Ignoring breakpoint URL edit: {err:#}"),
        }
    }
    if let Some(new_body) = edit.request_body {
        *body = Some(new_body);
    }
}

fn apply_response_edit(edit: ExchangeEdit, response: &mut ResponseHead, body: &mut Vec<u8>) {
    if let Some(status) = edit.status_code {
        response.status = status;
        response.reason = reason_phrase(status).to_string();
    }
    if let Some(headers) = edit.response_headers {
        response.headers = headers;
    }
    if let Some(new_body) = edit.response_body {
        *body = new_body;
    }
}

async fn read_final_head<U>(upstream: &mut WireReader<U>) -> anyhow::Result<ResponseHead>
where
    U: AsyncRead + Unpin,
{
    loop {
        let raw = upstream
            .read_head()
            .await?
            .ok_or_else(|| anyhow!("upstream closed before sending a response"))?;
        let head = ResponseHead::parse(&raw)?;
        if (100..200).contains(&head.status) && head.status != 101 {
            tracing::debug!("Skipping interim {} response", head.status);
            continue;
        }
        return Ok(head);
    }
}

/// Run one request read from `client` through the interception pipeline.
pub async fn handle_exchange<C>(
    ctx: &ProxyContext,
    client: &mut WireReader<C>,
    head: RequestHead,
    scheme: Scheme,
) -> anyhow::Result<Flow>
where
    C: AsyncRead + AsyncWrite + Unpin + Send,
{
    let mut target = match resolve_target(&head.target, &head.headers, scheme) {
        Ok(target) => target,
        Err(err) => {
            tracing::warn!("Rejecting request for {:?}: {err:#}", head.target);
            let _ = respond_with_status(
                client.get_mut(),
                400,
                "Bad Request",
                "Unable to determine request target",
            )
            .await;
            return Ok(Flow::Close);
        }
    };
    let framing = match head.framing() {
        Ok(framing) => framing,
        Err(err) => {
            tracing::warn!("Rejecting request with invalid framing: {err:#}");
            let _ = respond_with_status(client.get_mut(), 400, "Bad Request", "Invalid body framing")
                .await;
            return Ok(Flow::Close);
        }
    };

    let settings = ctx.shared.snapshot();
    let rules = settings.rules.clone();
    let regex = &ctx.shared.regex;
    let limit = ctx.shared.capture_limit;
    let shaper = &ctx.shared.shaper;

    let mut method = head.method.clone();
    let mut headers = head.headers.clone();
    let mut url = target.url();
    let is_ws = head.is_websocket_upgrade();
    let client_keep_alive = head.keep_alive();

    let mut exchange = Exchange::new(
        RequestRecord::new(
            Uuid::new_v4().to_string(),
            &method,
            &url,
            scheme == Scheme::Https,
            header_map(&headers),
        ),
        ctx.events.clone(),
    );

    if is_ws && !settings.ws_enabled {
        let _ = respond_with_status(
            client.get_mut(),
            403,
            "Forbidden",
            "WebSocket interception is disabled",
        )
        .await;
        exchange.fail(403, "WebSocket upgrade blocked");
        return Ok(Flow::Close);
    }
    exchange.publish_partial();

    let expects_continue = header_value(&headers, "expect")
        .map(|v| v.eq_ignore_ascii_case("100-continue"))
        .unwrap_or(false);
    if expects_continue {
        remove_header(&mut headers, "expect");
        if framing != BodyFraming::Empty {
            client
                .get_mut()
                .write_all(b"HTTP/1.1 100 Continue\r\n\r\n")
                .await?;
        }
    }

    // Request phase
    let mut buffered: Option<Vec<u8>> = None;
    if needs_request_body(&rules, &method, &url) {
        match read_body(framing, client, limit).await {
            Ok(body) => buffered = Some(body),
            Err(err) => return reject_request_body(client, &mut exchange, err).await,
        }
    }

    let mock = {
        let facts = RequestFacts {
            method: &method,
            url: &url,
            headers: &headers,
            body: buffered.as_deref(),
        };
        find_mock(&rules.mocks, &facts, regex).cloned()
    };
    if let Some(mock) = mock {
        let request_body = match buffered.take() {
            Some(body) => body,
            None => match read_body(framing, client, limit).await {
                Ok(body) => body,
                Err(err) => return reject_request_body(client, &mut exchange, err).await,
            },
        };
        let request_body = captured(request_body, &headers);
        return respond_with_mock(client, &mut exchange, mock, request_body, client_keep_alive)
            .await;
    }

    let request_rewrites: Vec<RewriteRule> = {
        let facts = RequestFacts {
            method: &method,
            url: &url,
            headers: &headers,
            body: buffered.as_deref(),
        };
        applicable_rewrites(&rules.rewrites, ExchangePhase::Request, &facts, regex)
            .into_iter()
            .cloned()
            .collect()
    };
    if !request_rewrites.is_empty() {
        let refs: Vec<&RewriteRule> = request_rewrites.iter().collect();
        let was_buffered = buffered.is_some();
        let mut scratch = buffered.take().unwrap_or_default();
        let mut overrides = HeaderOverrides::default();
        apply_rewrites(&refs, &headers, &mut scratch, &mut overrides, regex);
        overrides.apply_to(&mut headers);
        if was_buffered {
            buffered = Some(scratch);
        }
    }

    if let Some(rule) = find_breakpoint(&rules.breakpoints, ExchangePhase::Request, &method, &url)
    {
        let snapshot = BodySnapshot::from_bytes(buffered.as_deref().unwrap_or_default());
        let info = pending_breakpoint(rule, &exchange.record, ExchangePhase::Request, &headers, snapshot);
        match pause_at_breakpoint(ctx, info).await {
            BreakpointResolution::Drop => {
                let _ = respond_with_status(
                    client.get_mut(),
                    409,
                    "Conflict",
                    "Request dropped at breakpoint",
                )
                .await;
                exchange.fail(409, "Dropped at breakpoint");
                return Ok(Flow::Close);
            }
            BreakpointResolution::Forward { edit: Some(edit) } if !edit.is_empty() => {
                apply_request_edit(
                    edit,
                    &mut method,
                    &mut url,
                    &mut target,
                    &mut headers,
                    &mut buffered,
                );
                exchange.record.method = method.clone();
                exchange.record.url = url.clone();
                exchange.record.request_headers = header_map(&headers);
                exchange.publish_partial();
            }
            BreakpointResolution::Forward { .. } => {}
        }
    }

    let mut upstream_target = target.clone();
    if let Some(mapped) = map_remote_target(&rules.map_remotes, &method, &url) {
        match Target::from_url(&mapped) {
            Ok(mapped_target) => {
                tracing::info!("Map remote {} -> {}", url, mapped);
                set_header(&mut headers, "Host", mapped_target.authority());
                upstream_target = mapped_target;
                exchange.record.mapped_url = Some(mapped);
            }
            Err(err) => tracing::warn!("Ignoring map-remote target {mapped:?}: {err:#}"),
        }
    }

    // Response-phase rules only look at request data, so settle them now.
    let response_rewrites: Vec<RewriteRule> = {
        let facts = RequestFacts {
            method: &method,
            url: &url,
            headers: &headers,
            body: buffered.as_deref(),
        };
        applicable_rewrites(&rules.rewrites, ExchangePhase::Response, &facts, regex)
            .into_iter()
            .cloned()
            .collect()
    };
    let response_breakpoint =
        find_breakpoint(&rules.breakpoints, ExchangePhase::Response, &method, &url).cloned();
    let request_snapshot = response_breakpoint
        .as_ref()
        .map(|_| BodySnapshot::from_bytes(buffered.as_deref().unwrap_or_default()));

    if let Some(body) = &buffered {
        if framing != BodyFraming::Empty || !body.is_empty() {
            remove_header(&mut headers, "transfer-encoding");
            set_header(&mut headers, "Content-Length", body.len().to_string());
        }
    }

    shaper.delay().await;
    let upstream = match ctx.dialer.dial(&upstream_target).await {
        Ok(stream) => stream,
        Err(err) => {
            tracing::error!(
                "Failed to connect to upstream {} - {err:#}",
                upstream_target.dial_addr()
            );
            let _ = respond_with_status(
                client.get_mut(),
                502,
                "Bad Gateway",
                "Unable to reach upstream server",
            )
            .await;
            if let Some(body) = buffered {
                exchange.set_request_body(captured(body, &headers));
            }
            exchange.fail(502, format!("{err:#}"));
            return Ok(Flow::Close);
        }
    };
    let mut upstream = WireReader::new(upstream);

    let sent: anyhow::Result<CapturedBody> = async {
        write_request_head(
            upstream.get_mut(),
            &method,
            &upstream_target.path,
            &headers,
            is_ws,
        )
        .await?;
        match buffered {
            Some(body) => {
                write_limited(upstream.get_mut(), &body, &shaper.upload).await?;
                Ok(captured(body, &headers))
            }
            None => {
                let mut tap = BodyTap::new(
                    header_value(&headers, "content-type"),
                    header_value(&headers, "content-encoding"),
                    limit,
                );
                forward_body(framing, &mut *client, upstream.get_mut(), &shaper.upload, |chunk| {
                    tap.observe(chunk);
                })
                .await?;
                upstream.get_mut().flush().await?;
                Ok(tap.finish().unwrap_or_default())
            }
        }
    }
    .await;
    match sent {
        Ok(request_body) => exchange.set_request_body(request_body),
        Err(err) => {
            tracing::warn!("Failed to forward request upstream: {err:#}");
            let _ = respond_with_status(
                client.get_mut(),
                502,
                "Bad Gateway",
                "Failed to forward request",
            )
            .await;
            exchange.fail(502, format!("{err:#}"));
            return Ok(Flow::Close);
        }
    }

    // Response phase
    let mut response = match read_final_head(&mut upstream).await {
        Ok(head) => head,
        Err(err) => {
            tracing::error!("Failed to read response head: {err:#}");
            let _ = respond_with_status(client.get_mut(), 502, "Bad Gateway", "Failed to read response")
                .await;
            exchange.fail(502, format!("{err:#}"));
            return Ok(Flow::Close);
        }
    };
    exchange.record.status_code = response.status;
    exchange.record.response_headers = header_map(&response.headers);
    exchange.publish_partial();

    if is_ws && response.status == 101 {
        write_response_head(client.get_mut(), &response).await?;
        client.get_mut().flush().await?;
        exchange.finish(None);
        tracing::info!("WebSocket upgrade successful: {}", url);

        let session = WsSession {
            connection_id: exchange.record.id.clone(),
            url: target.ws_url(),
            events: ctx.events.clone(),
        };
        let client_prefix = client.take_buffered();
        let (upstream_stream, upstream_prefix) = upstream.into_parts();
        websocket_tunnel(
            client.get_mut(),
            client_prefix,
            upstream_stream,
            upstream_prefix,
            &shaper.upload,
            &shaper.download,
            session,
        )
        .await?;
        return Ok(Flow::Close);
    }

    let response_framing = match response.framing(&method) {
        Ok(framing) => framing,
        Err(err) => {
            tracing::warn!("Upstream sent invalid framing: {err:#}");
            let _ = respond_with_status(client.get_mut(), 502, "Bad Gateway", "Invalid upstream response")
                .await;
            exchange.fail(502, format!("{err:#}"));
            return Ok(Flow::Close);
        }
    };

    let rewrite_refs: Vec<&RewriteRule> = response_rewrites.iter().collect();
    let mut overrides = HeaderOverrides::default();

    if rewrites_touch_body(&rewrite_refs) || response_breakpoint.is_some() {
        let mut body = match read_body(response_framing, &mut upstream, limit).await {
            Ok(body) => body,
            Err(err) => {
                tracing::warn!("Failed to read response body: {err:#}");
                let _ = respond_with_status(client.get_mut(), 502, "Bad Gateway", "Failed to read response")
                    .await;
                exchange.fail(502, format!("{err:#}"));
                return Ok(Flow::Close);
            }
        };
        if !rewrite_refs.is_empty() {
            apply_rewrites(&rewrite_refs, &response.headers, &mut body, &mut overrides, regex);
            overrides.apply_to(&mut response.headers);
        }

        if let Some(rule) = &response_breakpoint {
            let mut info = pending_breakpoint(
                rule,
                &exchange.record,
                ExchangePhase::Response,
                &headers,
                request_snapshot.unwrap_or_default(),
            );
            info.status_code = Some(response.status);
            info.response_headers = Some(response.headers.clone());
            info.response_body = Some(BodySnapshot::from_bytes(&body));
            match pause_at_breakpoint(ctx, info).await {
                BreakpointResolution::Drop => {
                    let _ = respond_with_status(
                        client.get_mut(),
                        409,
                        "Conflict",
                        "Response dropped at breakpoint",
                    )
                    .await;
                    exchange.fail(409, "Dropped at breakpoint");
                    return Ok(Flow::Close);
                }
                BreakpointResolution::Forward { edit: Some(edit) } => {
                    apply_response_edit(edit, &mut response, &mut body);
                }
                BreakpointResolution::Forward { edit: None } => {}
            }
        }

        if method.eq_ignore_ascii_case("HEAD") || status_forbids_body(response.status) {
            if !body.is_empty() {
                tracing::debug!(
                    "Discarding {} body bytes for a {} {} response",
                    body.len(),
                    method,
                    response.status
                );
                body.clear();
            }
        } else {
            remove_header(&mut response.headers, "transfer-encoding");
            set_header(&mut response.headers, "Content-Length", body.len().to_string());
        }
        let reusable = client_keep_alive && !is_ws;
        set_connection_header(&mut response.headers, reusable);
        exchange.record.status_code = response.status;
        exchange.record.response_headers = header_map(&response.headers);

        shaper.delay().await;
        write_response_head(client.get_mut(), &response).await?;
        write_limited(client.get_mut(), &body, &shaper.download).await?;

        exchange.record.content_length = body.len() as u64;
        let capture = captured(body, &response.headers);
        exchange.finish(Some(capture));
        return Ok(if reusable { Flow::KeepAlive } else { Flow::Close });
    }

    if !rewrite_refs.is_empty() {
        let mut scratch = Vec::new();
        apply_rewrites(&rewrite_refs, &response.headers, &mut scratch, &mut overrides, regex);
        overrides.apply_to(&mut response.headers);
        exchange.record.response_headers = header_map(&response.headers);
    }
    let reusable = client_keep_alive && !is_ws && response_framing != BodyFraming::UntilClose;
    set_connection_header(&mut response.headers, reusable);

    shaper.delay().await;
    write_response_head(client.get_mut(), &response).await?;

    let mut tap = BodyTap::new(
        header_value(&response.headers, "content-type"),
        header_value(&response.headers, "content-encoding"),
        limit,
    );
    let streamed = forward_body(
        response_framing,
        &mut upstream,
        client.get_mut(),
        &shaper.download,
        |chunk| {
            if let Some(total) = tap.observe(chunk) {
                exchange.record.content_length = total;
                exchange.publish_partial();
            }
        },
    )
    .await;

    exchange.record.content_length = tap.total();
    match streamed {
        Ok(_) => {
            exchange.finish(tap.finish());
            Ok(if reusable { Flow::KeepAlive } else { Flow::Close })
        }
        Err(err) => {
            tracing::debug!("Response stream for {} ended early: {err:#}", url);
            exchange.record.error = Some(format!("{err:#}"));
            exchange.finish(tap.finish());
            Ok(Flow::Close)
        }
    }
}

async fn pause_at_breakpoint(ctx: &ProxyContext, info: PendingBreakpoint) -> BreakpointResolution {
    ctx.shared.breakpoints.pause(info, &ctx.events).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ConditionOperator, RuleCondition, RulePhase};

    fn body_rewrite(phase: RulePhase) -> RewriteRule {
        RewriteRule {
            id: "w".into(),
            enabled: true,
            url_pattern: "*/upload*".into(),
            method: Some("POST".into()),
            phase,
            target: RewriteTarget::Body,
            conditions: Vec::new(),
            pattern: "a".into(),
            replacement: "b".into(),
        }
    }

    #[test]
    fn request_body_is_buffered_only_when_a_rule_needs_it() {
        let mut rules = RuleSets::default();
        assert!(!needs_request_body(&rules, "POST", "http://h/upload"));

        rules.rewrites.push(body_rewrite(RulePhase::Response));
        assert!(!needs_request_body(&rules, "POST", "http://h/upload"));

        rules.rewrites.push(body_rewrite(RulePhase::Request));
        assert!(needs_request_body(&rules, "POST", "http://h/upload"));
        assert!(!needs_request_body(&rules, "GET", "http://h/upload"));
        assert!(!needs_request_body(&rules, "POST", "http://h/other"));

        let mut header_rule = body_rewrite(RulePhase::Response);
        header_rule.url_pattern = "*/search".into();
        header_rule.target = RewriteTarget::Header { name: "x".into() };
        header_rule.conditions.push(RuleCondition {
            kind: ConditionKind::Body,
            key: String::new(),
            operator: ConditionOperator::Contains,
            value: "needle".into(),
        });
        rules.rewrites.push(header_rule);
        assert!(needs_request_body(&rules, "POST", "http://h/search"));
    }

    #[test]
    fn breakpoint_rules_force_request_buffering() {
        let mut rules = RuleSets::default();
        rules.breakpoints.push(BreakpointRule {
            id: "b".into(),
            url_pattern: "*".into(),
            method: None,
            phase: RulePhase::Request,
        });
        assert!(needs_request_body(&rules, "PUT", "http://h/any"));

        rules.breakpoints[0].phase = RulePhase::Response;
        assert!(!needs_request_body(&rules, "PUT", "http://h/any"));
    }

    #[test]
    fn connection_header_reflects_reuse() {
        let mut headers = vec![
            ("Connection".to_string(), "keep-alive".to_string()),
            ("Keep-Alive".to_string(), "timeout=5".to_string()),
            ("Content-Type".to_string(), "text/plain".to_string()),
        ];
        set_connection_header(&mut headers, true);
        assert_eq!(headers.len(), 1);

        set_connection_header(&mut headers, false);
        assert_eq!(header_value(&headers, "connection"), Some("close"));
    }

    #[tokio::test]
    async fn abandoned_exchange_still_publishes_one_terminal_record() {
        let (events, mut rx) = EventDispatcher::channel();
        let record = RequestRecord::new(
            "id-1".into(),
            "GET",
            "http://example.com/",
            false,
            HashMap::new(),
        );
        {
            let exchange = Exchange::new(record, events);
            exchange.publish_partial();
        }

        let mut terminal = Vec::new();
        while let Some(ProxyEvent::Request(record)) = rx.recv().await {
            if !record.partial_update {
                terminal.push(record);
            }
        }
        assert_eq!(terminal.len(), 1);
        assert!(terminal[0].error.is_some());
        assert!(terminal[0].finished_at.is_some());
    }
}
