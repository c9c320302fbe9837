//! Forward Orchestrator (spec §4 C5): the seam that ties L3 (token
//! provider), L5 (account pool), L6 (sticky sessions), and C1-C4 (retry
//! loop, smart-retry decider, signature-error recovery, protocol bridge)
//! into one "take a Claude request, return a Claude response" operation.
//!
//! Grounded on `gproxy-core::proxy_engine::mod.rs`'s `handle_protocol`,
//! generalized from its provider-registry dispatch to this engine's single
//! Antigravity provider family.

use std::sync::Arc;
use std::time::Duration;

use time::OffsetDateTime;
use tracing::{debug, warn};

use antigate_protocol::claude::types::{CreateMessageRequestBody, Message};
use antigate_protocol::envelope::InternalRequest;
use antigate_protocol::gemini::types::GenerateContentRequest;
use antigate_protocol::sse::SseParser;
use antigate_provider_core::{Account, AccountId, AccountPool, UnavailableReason};
use antigate_transform::claude2gemini;
use antigate_transform::gemini2claude;
use antigate_transform::model_mapping::map_model;
use antigate_transform::signature_recovery::{self, RecoveryStage};
use antigate_transform::stream2nostream::GeminiPartsCollector;

use crate::error::CoreError;
use crate::journal::{JournalEntry, RequestJournal};
use crate::rate_limit::{self, FailoverClass, SmartRetryDecision};
use crate::retry_loop::{self, FailureKind, RetryDecision, TransportFailureKind};
use crate::sticky_session::{StickyKey, StickySessionCache};
use crate::token_provider::TokenProvider;
use crate::upstream_client::{UpstreamRequest, WreqUpstreamClient};
use crate::url_tracker::UrlAvailabilityTracker;

const ANTIGRAVITY_USER_AGENT: &str = "antigravity-ide";
const GENERATE_CONTENT_PATH: &str = "v1internal:streamGenerateContent";

pub struct OrchestratorConfig {
    pub model_mapping: std::collections::BTreeMap<String, String>,
    pub max_attempts_per_url: u32,
    pub smart_retry_threshold: Duration,
    pub smart_retry_min_wait: Duration,
    pub default_rate_limit_window: Duration,
    pub journal_capacity: usize,
    /// Bound passed to every [`SseParser`] this orchestrator builds (spec
    /// §3 `max_line_size`, `GatewayConfig::max_line_size`).
    pub max_line_size: usize,
}

pub struct ForwardRequest {
    pub group_id: String,
    pub session_fingerprint: Option<String>,
    pub is_sticky_session: bool,
    pub body: CreateMessageRequestBody,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Surface {
    NonStream,
    Stream,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ForwardError {
    /// Spec §4.C1/§4.C2: every base URL exhausted its account candidates.
    /// `force_cache_billing` is set exactly when the failing request came
    /// in on a sticky session (resolved open question, spec §9).
    UpstreamFailover { status: u16, force_cache_billing: bool },
    ClientError { status: u16, body: String },
    NoAccountsAvailable,
    Other(String),
}

impl From<CoreError> for ForwardError {
    fn from(error: CoreError) -> Self {
        ForwardError::Other(error.to_string())
    }
}

pub struct ForwardOrchestrator {
    pool: Arc<AccountPool>,
    urls: Arc<UrlAvailabilityTracker>,
    sticky: Arc<StickySessionCache>,
    tokens: Arc<TokenProvider>,
    client: Arc<WreqUpstreamClient>,
    config: OrchestratorConfig,
}

impl ForwardOrchestrator {
    pub fn new(
        pool: Arc<AccountPool>,
        urls: Arc<UrlAvailabilityTracker>,
        sticky: Arc<StickySessionCache>,
        tokens: Arc<TokenProvider>,
        client: Arc<WreqUpstreamClient>,
        config: OrchestratorConfig,
    ) -> Self {
        Self { pool, urls, sticky, tokens, client, config }
    }

    /// Non-streaming Claude `messages` dispatch. Always calls the
    /// streaming upstream endpoint and collapses it with
    /// [`GeminiPartsCollector`], per spec §4.C4's stream-to-non-stream note.
    pub async fn forward_nonstream(
        &self,
        request: ForwardRequest,
        journal: &mut RequestJournal,
    ) -> Result<Message, ForwardError> {
        let message_id = format!("msg_{}", uuid::Uuid::new_v4());
        let thinking_enabled = request.body.thinking.is_some();
        let requested_model = request.body.model.clone();
        let Some(mapped_model) = map_model(&self.config.model_mapping, &requested_model, thinking_enabled) else {
            return Err(ForwardError::ClientError {
                status: 403,
                body: format!("model not in whitelist: {requested_model}"),
            });
        };

        let (status, body) = self.dispatch_with_retries(request, &mapped_model, journal).await?;
        let response: antigate_protocol::gemini::types::GenerateContentResponse =
            decode_collected(&body, self.config.max_line_size)?;
        let _ = status;
        Ok(gemini2claude::transform_response(message_id, &requested_model, response))
    }

    /// Runs the full outer-URL x inner-account attempt loop for one
    /// logical request, returning the merged non-stream Gemini response
    /// bytes on success. This is the actual C1/C2/C3 integration point;
    /// [`forward_nonstream`] only knows how to transform in and out of it.
    async fn dispatch_with_retries(
        &self,
        request: ForwardRequest,
        mapped_model: &str,
        journal: &mut RequestJournal,
    ) -> Result<(u16, Vec<u8>), ForwardError> {
        let sticky_key = request.session_fingerprint.as_ref().map(|fingerprint| StickyKey {
            group_id: request.group_id.clone(),
            session_fingerprint: fingerprint.clone(),
        });

        let mut gemini_request = claude2gemini::transform_request(
            mapped_model.to_string(),
            String::new(),
            request.body.clone(),
        );
        let mut recovery_stage: Option<RecoveryStage> = None;

        let urls = self.urls.ordered();
        if urls.is_empty() {
            return Err(ForwardError::Other("no base urls configured".into()));
        }

        for (url_index, base_url) in urls.iter().enumerate() {
            let urls_remaining = (urls.len() - url_index - 1) as u32;
            let mut attempt_no: u32 = 0;
            // Set once a short-`retryDelay` smart retry has fired, so the
            // *next* attempt reuses the same account (spec §4.C2 branch 4)
            // instead of going through the weighted pool/sticky pick again.
            let mut held_account: Option<Account> = None;
            // True only for the one attempt that is itself the in-place
            // smart retry; its own 429/503 bypasses the decider (no
            // recursive smart retry) per spec §4.C2 branch 4.
            let mut short_retry_pending = false;

            loop {
                attempt_no += 1;
                let account = match held_account.take() {
                    Some(account) => account,
                    None => match self.select_account(sticky_key.as_ref(), mapped_model).await {
                        Ok(account) => account,
                        Err(_) if urls_remaining > 0 => break,
                        Err(_) => return Err(ForwardError::NoAccountsAvailable),
                    },
                };

                if let Some(key) = &sticky_key {
                    self.sticky.bind(key.clone(), account.id);
                }
                gemini_request.project = account
                    .credential
                    .project_id
                    .clone()
                    .unwrap_or_default();

                let outcome = self
                    .attempt_once(base_url, &account, &gemini_request)
                    .await;

                match outcome {
                    Ok((status, body)) => {
                        self.urls.record_success(base_url);
                        journal.push(attempt_journal_entry(
                            "request_success",
                            Some(base_url.clone()),
                            Some(account.id),
                            attempt_no,
                            Some(status),
                            "ok".to_string(),
                        ));
                        return Ok((status, body));
                    }
                    Err(AttemptFailure::Transport(kind)) => {
                        short_retry_pending = false;
                        self.urls.record_failure(base_url);
                        journal.push(attempt_journal_entry(
                            "transport_error",
                            Some(base_url.clone()),
                            Some(account.id),
                            attempt_no,
                            None,
                            format!("{kind:?}"),
                        ));
                        let decision = retry_loop::decide(
                            FailureKind::Transport(kind),
                            attempt_no,
                            self.config.max_attempts_per_url,
                            urls_remaining,
                        );
                        if self.apply_decision(decision, attempt_no).await {
                            continue;
                        }
                        if decision == RetryDecision::SwitchUrl {
                            break;
                        }
                        return Err(ForwardError::Other(format!("transport failure: {kind:?}")));
                    }
                    Err(AttemptFailure::Status { status, body }) => {
                        if let Some(stage) = self.maybe_signature_recovery(status, &body, recovery_stage) {
                            recovery_stage = Some(stage);
                            short_retry_pending = false;
                            gemini_request = claude2gemini::transform_request(
                                mapped_model.to_string(),
                                gemini_request.project.clone(),
                                signature_recovery::rewrite(&request.body, stage),
                            );
                            continue;
                        }

                        let class = rate_limit::classify_status(status);
                        if class == FailoverClass::ClientError {
                            return Err(ForwardError::ClientError { status, body });
                        }

                        let allow_smart_retry = !short_retry_pending;
                        let account_id = account.id;
                        let failover = self
                            .classify_failover(status, &body, &account, sticky_key.as_ref(), allow_smart_retry)
                            .await;

                        let force_cache_billing = match failover {
                            FailoverOutcome::InPlaceRetry { wait } => {
                                journal.push(attempt_journal_entry(
                                    "smart_retry",
                                    Some(base_url.clone()),
                                    Some(account_id),
                                    attempt_no,
                                    Some(status),
                                    "in-place smart retry".to_string(),
                                ));
                                tokio::time::sleep(wait).await;
                                short_retry_pending = true;
                                held_account = Some(account);
                                continue;
                            }
                            FailoverOutcome::Switch { force_cache_billing } => {
                                short_retry_pending = false;
                                force_cache_billing
                            }
                        };

                        let decision = retry_loop::decide(
                            FailureKind::Status(status),
                            attempt_no,
                            self.config.max_attempts_per_url,
                            urls_remaining,
                        );
                        if self.apply_decision(decision, attempt_no).await {
                            continue;
                        }
                        if decision == RetryDecision::SwitchUrl {
                            break;
                        }
                        return Err(ForwardError::UpstreamFailover { status, force_cache_billing });
                    }
                }
            }
        }

        Err(ForwardError::UpstreamFailover { status: 503, force_cache_billing: request.is_sticky_session })
    }

    async fn select_account(
        &self,
        sticky_key: Option<&StickyKey>,
        model: &str,
    ) -> Result<Account, CoreError> {
        if let Some(key) = sticky_key
            && let Some(account_id) = self.sticky.lookup(key)
            && !self.pool.has_active_model_disallow(account_id, model).await
        {
            // Sticky lookup bypasses the weighted pick but still needs the
            // account's current credential/weight row.
            if let Ok(account) = self.pool.acquire_for_model(model).await {
                if account.id == account_id {
                    return Ok(account);
                }
            }
        }
        self.pool.acquire_for_model(model).await.map_err(CoreError::from)
    }

    /// Returns `true` if the caller should retry the same account after
    /// `decision`'s backoff; `false` means move to the next account/URL or
    /// give up, per the caller's own follow-up match.
    async fn apply_decision(&self, decision: RetryDecision, attempt_no: u32) -> bool {
        match decision {
            RetryDecision::RetrySameAccount { wait } => {
                tokio::time::sleep(wait).await;
                true
            }
            RetryDecision::SwitchAccount => {
                retry_loop::backoff_sleep(attempt_no).await;
                false
            }
            RetryDecision::SwitchUrl | RetryDecision::GiveUp => false,
        }
    }

    fn maybe_signature_recovery(&self, status: u16, body: &str, stage: Option<RecoveryStage>) -> Option<RecoveryStage> {
        if status != 400 || !signature_recovery::is_signature_error(body) {
            return None;
        }
        match stage {
            None => Some(RecoveryStage::ThinkingOnly),
            Some(RecoveryStage::ThinkingOnly) => Some(RecoveryStage::ThinkingAndTools),
            Some(RecoveryStage::ThinkingAndTools) => None,
        }
    }

    /// Convenience wrapper around the pool's account-level/model-level
    /// marks, picking the model-keyed one when the classifier resolved a
    /// model name.
    async fn mark_rate_limited(&self, account_id: AccountId, model: Option<String>, reset_after: Duration) {
        if let Some(model) = model {
            self.pool
                .mark_model_unavailable(account_id, model, reset_after, UnavailableReason::RateLimit)
                .await;
        } else {
            self.pool.mark_unavailable(account_id, reset_after, UnavailableReason::RateLimit).await;
        }
    }

    /// Classifies a failover-eligible status, applies the L5 rate-limit
    /// mark it implies, and reports whether the caller should reissue the
    /// same account in place (spec §4.C2 branch 4) or switch accounts
    /// (spec §4.C2's `AccountSwitchSignal` -> `ForceCacheBilling`).
    ///
    /// `allow_smart_retry` is false on the one bypass response after an
    /// in-place smart-retry wait: spec §4.C2 says not to recursively
    /// smart-retry on that retry's own response, so a second consecutive
    /// 429/503 is marked with the latest `retryDelay` (or default) via the
    /// generic L4 fallback instead of re-entering the decider.
    async fn classify_failover(
        &self,
        status: u16,
        body: &str,
        account: &Account,
        sticky_key: Option<&StickyKey>,
        allow_smart_retry: bool,
    ) -> FailoverOutcome {
        let is_sticky = sticky_key.is_some();

        if allow_smart_retry && matches!(status, 429 | 503) {
            match rate_limit::decide_smart_retry(
                status,
                body,
                self.config.smart_retry_threshold,
                self.config.smart_retry_min_wait,
            ) {
                SmartRetryDecision::LongDelay { model, retry_delay } => {
                    self.mark_rate_limited(account.id, model, retry_delay).await;
                    if let Some(key) = sticky_key {
                        self.sticky.invalidate(key);
                    }
                    return FailoverOutcome::Switch { force_cache_billing: is_sticky };
                }
                SmartRetryDecision::ShortDelay { wait, .. } => {
                    return FailoverOutcome::InPlaceRetry { wait };
                }
                SmartRetryDecision::UrlLevel | SmartRetryDecision::NotCandidate => {}
            }
        }

        if !allow_smart_retry && matches!(status, 429 | 503) {
            let mark = rate_limit::generic_rate_limit_mark(body, self.config.default_rate_limit_window);
            self.mark_rate_limited(account.id, mark.model, mark.reset_after).await;
        } else if status == 429 {
            let mark = rate_limit::generic_rate_limit_mark(body, self.config.default_rate_limit_window);
            self.mark_rate_limited(account.id, mark.model, mark.reset_after).await;
        } else if matches!(status, 401 | 403) {
            self.pool.mark_unavailable(account.id, Duration::from_secs(300), UnavailableReason::AuthInvalid).await;
        } else if (500..=599).contains(&status) {
            self.pool.mark_unavailable(account.id, Duration::from_secs(30), UnavailableReason::Upstream5xx).await;
        }

        if let Some(key) = sticky_key {
            self.sticky.invalidate(key);
        }
        FailoverOutcome::Switch { force_cache_billing: is_sticky }
    }

    async fn attempt_once(
        &self,
        base_url: &str,
        account: &Account,
        request: &InternalRequest<GenerateContentRequest>,
    ) -> Result<(u16, Vec<u8>), AttemptFailure> {
        let mut credential = account.credential.clone();
        let token = self
            .tokens
            .access_token(account.id, &mut credential, None)
            .await
            .map_err(|err| AttemptFailure::Status { status: 401, body: err.to_string() })?;

        let body = serde_json::to_vec(request).unwrap_or_default();
        let url = format!("{}/{}", base_url.trim_end_matches('/'), GENERATE_CONTENT_PATH);
        let headers = [("User-Agent", ANTIGRAVITY_USER_AGENT.to_string())];

        let streaming = self
            .client
            .send_streaming(
                account.id,
                UpstreamRequest {
                    url: &url,
                    bearer_token: &token,
                    body: bytes::Bytes::from(body),
                    headers: &headers,
                },
            )
            .await
            .map_err(AttemptFailure::Transport)?;

        let status = streaming.status;
        let mut rx = streaming.chunks;
        let mut buffer = Vec::new();
        while let Some(chunk) = rx.recv().await {
            match chunk {
                Ok(bytes) => buffer.extend_from_slice(&bytes),
                Err(kind) => return Err(AttemptFailure::Transport(kind)),
            }
        }

        if !(200..300).contains(&status) {
            let text = String::from_utf8_lossy(&buffer).into_owned();
            return Err(AttemptFailure::Status { status, body: text });
        }

        Ok((status, buffer))
    }
}

enum AttemptFailure {
    Transport(TransportFailureKind),
    Status { status: u16, body: String },
}

/// Result of [`ForwardOrchestrator::classify_failover`]: either reissue the
/// same account in place once (spec §4.C2 branch 4's short `retryDelay`
/// wait-and-retry) or proceed to the ordinary switch-account/switch-url
/// decision with the given billing flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FailoverOutcome {
    InPlaceRetry { wait: Duration },
    Switch { force_cache_billing: bool },
}

/// Cap on how much of an error body the streaming attempt path buffers to
/// classify a non-2xx status, per spec §4.C1 step 5 ("read up to 2 MiB of
/// the body"). A 2xx response is never buffered here; its channel is handed
/// straight to the caller for passthrough.
const ERROR_BODY_CAP_BYTES: usize = 2 * 1024 * 1024;

/// One real (non-ping, non-message_stop) streamed Claude event, formatted as
/// an SSE frame ready to write to the client.
pub struct StreamChunk {
    pub frame: bytes::Bytes,
}

/// Item type of [`ForwardOrchestrator::forward_stream`]'s channel. A failure
/// that arrives after streaming has already started (upstream idle timeout,
/// oversized SSE line) is represented as one final `event: error` frame
/// rather than a channel error, matching spec §4.C4's "never a mid-stream
/// abort without at least one error frame" rule; failures before any bytes
/// are written surface instead as `forward_stream`'s own `Err(ForwardError)`.
pub type StreamResult = StreamChunk;

impl ForwardOrchestrator {
    /// Streaming Claude `messages` dispatch (spec §4.C4/§4.C5's other
    /// branch). Runs the same C1/C2/C3 retry machinery as
    /// [`Self::forward_nonstream`] up to the first byte; once an attempt's
    /// status line comes back 2xx, the upstream SSE stream is forwarded
    /// chunk-by-chunk through [`gemini2claude::GeminiStreamToClaudeEvents`]
    /// rather than buffered, so first-byte latency reflects the real
    /// upstream response instead of this engine's own collection.
    pub async fn forward_stream(
        &self,
        request: ForwardRequest,
        mut journal: RequestJournal,
    ) -> Result<tokio::sync::mpsc::Receiver<StreamResult>, ForwardError> {
        let message_id = format!("msg_{}", uuid::Uuid::new_v4());
        let thinking_enabled = request.body.thinking.is_some();
        let requested_model = request.body.model.clone();
        let Some(mapped_model) = map_model(&self.config.model_mapping, &requested_model, thinking_enabled) else {
            return Err(ForwardError::ClientError {
                status: 403,
                body: format!("model not in whitelist: {requested_model}"),
            });
        };

        let is_sticky_session = request.is_sticky_session;
        let max_line_size = self.config.max_line_size;
        let upstream = self
            .dispatch_stream_with_retries(request, &mapped_model, &mut journal)
            .await?;

        let (tx, rx) = tokio::sync::mpsc::channel(32);
        tokio::spawn(async move {
            let _ = is_sticky_session;
            let mut parser = SseParser::with_max_line_size(max_line_size);
            let mut bridge = gemini2claude::GeminiStreamToClaudeEvents::new(message_id, requested_model);
            let mut chunks = upstream.chunks;
            let mut had_error = false;

            while let Some(item) = chunks.recv().await {
                let bytes = match item {
                    Ok(bytes) => bytes,
                    Err(_) => {
                        had_error = true;
                        let frame = format_error_frame("stream_timeout");
                        let _ = tx.send(StreamChunk { frame }).await;
                        break;
                    }
                };
                let events = match parser.push_bytes(&bytes) {
                    Ok(events) => events,
                    Err(_) => {
                        had_error = true;
                        let frame = format_error_frame("response_too_large");
                        let _ = tx.send(StreamChunk { frame }).await;
                        break;
                    }
                };
                // Ignore send failures here rather than stop: a disconnected
                // client still needs the upstream drained for accurate usage
                // accounting (spec §4.C4), so the loop keeps running even
                // after `tx`'s receiver is gone.
                emit_bridge_events(&mut bridge, events, &tx).await;
            }

            if !had_error {
                let trailing = parser.finish();
                emit_bridge_events(&mut bridge, trailing, &tx).await;
                for event in bridge.finish() {
                    let _ = tx.send(StreamChunk { frame: format_event(&event) }).await;
                }
            }
        });

        Ok(rx)
    }

    /// Streaming counterpart to [`Self::dispatch_with_retries`]: identical
    /// outer-URL x inner-attempt control flow, but a successful attempt's
    /// byte channel is returned directly to the caller instead of buffered,
    /// and failing attempts only buffer up to [`ERROR_BODY_CAP_BYTES`] to
    /// classify the error.
    async fn dispatch_stream_with_retries(
        &self,
        request: ForwardRequest,
        mapped_model: &str,
        journal: &mut RequestJournal,
    ) -> Result<crate::upstream_client::StreamingUpstreamResponse, ForwardError> {
        let sticky_key = request.session_fingerprint.as_ref().map(|fingerprint| StickyKey {
            group_id: request.group_id.clone(),
            session_fingerprint: fingerprint.clone(),
        });

        let mut gemini_request = claude2gemini::transform_request(
            mapped_model.to_string(),
            String::new(),
            request.body.clone(),
        );
        let mut recovery_stage: Option<RecoveryStage> = None;

        let urls = self.urls.ordered();
        if urls.is_empty() {
            return Err(ForwardError::Other("no base urls configured".into()));
        }

        for (url_index, base_url) in urls.iter().enumerate() {
            let urls_remaining = (urls.len() - url_index - 1) as u32;
            let mut attempt_no: u32 = 0;
            // See the matching comments in `dispatch_with_retries`: these
            // two carry the spec §4.C2 branch 4 in-place smart retry across
            // loop iterations on the same account.
            let mut held_account: Option<Account> = None;
            let mut short_retry_pending = false;

            loop {
                attempt_no += 1;
                let account = match held_account.take() {
                    Some(account) => account,
                    None => match self.select_account(sticky_key.as_ref(), mapped_model).await {
                        Ok(account) => account,
                        Err(_) if urls_remaining > 0 => break,
                        Err(_) => return Err(ForwardError::NoAccountsAvailable),
                    },
                };

                if let Some(key) = &sticky_key {
                    self.sticky.bind(key.clone(), account.id);
                }
                gemini_request.project = account.credential.project_id.clone().unwrap_or_default();

                match self.attempt_once_streaming(base_url, &account, &gemini_request).await {
                    Ok(streaming) => {
                        self.urls.record_success(base_url);
                        journal.push(attempt_journal_entry(
                            "request_success",
                            Some(base_url.clone()),
                            Some(account.id),
                            attempt_no,
                            Some(streaming.status),
                            "ok".to_string(),
                        ));
                        return Ok(streaming);
                    }
                    Err(AttemptFailure::Transport(kind)) => {
                        short_retry_pending = false;
                        self.urls.record_failure(base_url);
                        journal.push(attempt_journal_entry(
                            "transport_error",
                            Some(base_url.clone()),
                            Some(account.id),
                            attempt_no,
                            None,
                            format!("{kind:?}"),
                        ));
                        let decision = retry_loop::decide(
                            FailureKind::Transport(kind),
                            attempt_no,
                            self.config.max_attempts_per_url,
                            urls_remaining,
                        );
                        if self.apply_decision(decision, attempt_no).await {
                            continue;
                        }
                        if decision == RetryDecision::SwitchUrl {
                            break;
                        }
                        return Err(ForwardError::Other(format!("transport failure: {kind:?}")));
                    }
                    Err(AttemptFailure::Status { status, body }) => {
                        if let Some(stage) = self.maybe_signature_recovery(status, &body, recovery_stage) {
                            recovery_stage = Some(stage);
                            short_retry_pending = false;
                            gemini_request = claude2gemini::transform_request(
                                mapped_model.to_string(),
                                gemini_request.project.clone(),
                                signature_recovery::rewrite(&request.body, stage),
                            );
                            continue;
                        }

                        let class = rate_limit::classify_status(status);
                        if class == FailoverClass::ClientError {
                            return Err(ForwardError::ClientError { status, body });
                        }

                        let allow_smart_retry = !short_retry_pending;
                        let account_id = account.id;
                        let failover = self
                            .classify_failover(status, &body, &account, sticky_key.as_ref(), allow_smart_retry)
                            .await;

                        let force_cache_billing = match failover {
                            FailoverOutcome::InPlaceRetry { wait } => {
                                journal.push(attempt_journal_entry(
                                    "smart_retry",
                                    Some(base_url.clone()),
                                    Some(account_id),
                                    attempt_no,
                                    Some(status),
                                    "in-place smart retry".to_string(),
                                ));
                                tokio::time::sleep(wait).await;
                                short_retry_pending = true;
                                held_account = Some(account);
                                continue;
                            }
                            FailoverOutcome::Switch { force_cache_billing } => {
                                short_retry_pending = false;
                                force_cache_billing
                            }
                        };

                        let decision = retry_loop::decide(
                            FailureKind::Status(status),
                            attempt_no,
                            self.config.max_attempts_per_url,
                            urls_remaining,
                        );
                        if self.apply_decision(decision, attempt_no).await {
                            continue;
                        }
                        if decision == RetryDecision::SwitchUrl {
                            break;
                        }
                        return Err(ForwardError::UpstreamFailover { status, force_cache_billing });
                    }
                }
            }
        }

        Err(ForwardError::UpstreamFailover { status: 503, force_cache_billing: request.is_sticky_session })
    }

    /// Like [`Self::attempt_once`], but a 2xx status hands the live channel
    /// straight back instead of draining it; only a non-2xx body is
    /// buffered (bounded by [`ERROR_BODY_CAP_BYTES`]) so the retry/failover
    /// decision tree can classify it.
    async fn attempt_once_streaming(
        &self,
        base_url: &str,
        account: &Account,
        request: &InternalRequest<GenerateContentRequest>,
    ) -> Result<crate::upstream_client::StreamingUpstreamResponse, AttemptFailure> {
        let mut credential = account.credential.clone();
        let token = self
            .tokens
            .access_token(account.id, &mut credential, None)
            .await
            .map_err(|err| AttemptFailure::Status { status: 401, body: err.to_string() })?;

        let body = serde_json::to_vec(request).unwrap_or_default();
        let url = format!("{}/{}", base_url.trim_end_matches('/'), GENERATE_CONTENT_PATH);
        let headers = [("User-Agent", ANTIGRAVITY_USER_AGENT.to_string())];

        let mut streaming = self
            .client
            .send_streaming(
                account.id,
                UpstreamRequest {
                    url: &url,
                    bearer_token: &token,
                    body: bytes::Bytes::from(body),
                    headers: &headers,
                },
            )
            .await
            .map_err(AttemptFailure::Transport)?;

        if (200..300).contains(&streaming.status) {
            return Ok(streaming);
        }

        let mut buffer = Vec::new();
        while let Some(chunk) = streaming.chunks.recv().await {
            match chunk {
                Ok(bytes) => {
                    buffer.extend_from_slice(&bytes);
                    if buffer.len() >= ERROR_BODY_CAP_BYTES {
                        break;
                    }
                }
                Err(kind) => return Err(AttemptFailure::Transport(kind)),
            }
        }
        let text = String::from_utf8_lossy(&buffer).into_owned();
        Err(AttemptFailure::Status { status: streaming.status, body: text })
    }
}

/// Formats one bridged Claude stream event as an SSE frame.
fn format_event(event: &antigate_protocol::claude::types::StreamEvent) -> bytes::Bytes {
    let data = serde_json::to_string(event).unwrap_or_default();
    bytes::Bytes::from(format!("event: {}\ndata: {}\n\n", event.event_name(), data))
}

/// One-shot `event: error` frame (spec §4.C4 timeout/line-size handling).
fn format_error_frame(code: &str) -> bytes::Bytes {
    bytes::Bytes::from(format!("event: error\ndata: {{\"error\":\"{code}\"}}\n\n"))
}

/// Decodes each parsed SSE event's `data:` payload, feeds it through the
/// Gemini->Claude stream bridge, and writes the resulting frames to `tx`.
/// Send failures (client disconnected) are swallowed rather than stopping
/// the caller's read loop: the upstream keeps draining for accurate usage
/// accounting even once nothing is left to deliver (spec §4.C4).
async fn emit_bridge_events(
    bridge: &mut gemini2claude::GeminiStreamToClaudeEvents,
    events: Vec<antigate_protocol::sse::SseEvent>,
    tx: &tokio::sync::mpsc::Sender<StreamResult>,
) {
    for event in events {
        let Ok(chunk) = antigate_protocol::envelope::unwrap_response(&event.data) else {
            continue;
        };
        for out in bridge.push_chunk(chunk) {
            let _ = tx.send(StreamChunk { frame: format_event(&out) }).await;
        }
    }
}

/// Decodes a buffered SSE stream of Gemini `streamGenerateContent` chunks
/// into one merged non-stream response, via [`GeminiPartsCollector`].
fn decode_collected(
    body: &[u8],
    max_line_size: usize,
) -> Result<antigate_protocol::gemini::types::GenerateContentResponse, ForwardError> {
    let mut parser = SseParser::with_max_line_size(max_line_size);
    let text = String::from_utf8_lossy(body);
    let events = parser
        .push_str(&text)
        .map_err(|_| ForwardError::Other("response_too_large".into()))?;
    let mut collector = GeminiPartsCollector::new();
    for event in events.into_iter().chain(parser.finish()) {
        if let Ok(chunk) = antigate_protocol::envelope::unwrap_response(&event.data) {
            collector.push_chunk(chunk);
        }
    }
    Ok(collector.finish())
}

/// Builds one journal entry for a dispatch attempt, matching the
/// `{kind, base_url, account_id, attempt_no, status, message}` shape the
/// gproxy's `emit_upstream_event!` call sites populate.
pub fn attempt_journal_entry(
    kind: &'static str,
    base_url: Option<String>,
    account_id: Option<AccountId>,
    attempt_no: u32,
    status: Option<u16>,
    message: String,
) -> JournalEntry {
    JournalEntry {
        at: OffsetDateTime::now_utc(),
        kind,
        base_url,
        account_id,
        attempt_no,
        status,
        message,
    }
}

#[allow(dead_code)]
fn log_attempt(base_url: &str, account_id: AccountId, attempt_no: u32, status: Option<u16>) {
    if status.is_some_and(|status| !(200..300).contains(&status)) {
        warn!(base_url, account_id, attempt_no, ?status, "upstream attempt failed");
    } else {
        debug!(base_url, account_id, attempt_no, ?status, "upstream attempt");
    }
}

/// Picks which of [`Self::forward_nonstream`] / [`Self::forward_stream`] a
/// request should use, per the client's own `stream` flag.
pub fn surface_for(stream_requested: bool) -> Surface {
    if stream_requested { Surface::Stream } else { Surface::NonStream }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn surface_selection_follows_the_stream_flag() {
        assert_eq!(surface_for(true), Surface::Stream);
        assert_eq!(surface_for(false), Surface::NonStream);
    }

    #[test]
    fn force_cache_billing_matches_resolved_open_question() {
        let sticky = ForwardError::UpstreamFailover { status: 503, force_cache_billing: true };
        let plain = ForwardError::UpstreamFailover { status: 503, force_cache_billing: false };
        assert_ne!(sticky, plain);
    }

    #[test]
    fn decode_collected_merges_sse_chunks_into_one_response() {
        let body = b"data: {\"candidates\":[{\"content\":{\"role\":\"model\",\"parts\":[{\"text\":\"hi\"}]}}]}\n\n";
        let response = decode_collected(body, 64 * 1024).unwrap();
        assert_eq!(response.candidates[0].content.parts[0].text.as_deref(), Some("hi"));
    }

    #[test]
    fn decode_collected_unwraps_v1internal_response_envelope() {
        let body = b"data: {\"response\":{\"candidates\":[{\"content\":{\"role\":\"model\",\"parts\":[{\"text\":\"hi\"}]}}]}}\n\n";
        let response = decode_collected(body, 64 * 1024).unwrap();
        assert_eq!(response.candidates[0].content.parts[0].text.as_deref(), Some("hi"));
    }

    #[test]
    fn format_event_writes_the_event_name_and_json_data_line() {
        use antigate_protocol::claude::types::StreamEvent;
        let frame = format_event(&StreamEvent::MessageStop);
        let text = String::from_utf8(frame.to_vec()).unwrap();
        assert_eq!(text, "event: message_stop\ndata: {\"type\":\"message_stop\"}\n\n");
    }

    #[test]
    fn format_error_frame_is_a_single_sse_event() {
        let frame = format_error_frame("stream_timeout");
        let text = String::from_utf8(frame.to_vec()).unwrap();
        assert_eq!(text, "event: error\ndata: {\"error\":\"stream_timeout\"}\n\n");
    }

    #[tokio::test]
    async fn emit_bridge_events_formats_a_text_delta_from_one_chunk() {
        use antigate_protocol::gemini::types::{Candidate, Content, Part};
        use antigate_protocol::sse::SseEvent;

        let mut bridge = gemini2claude::GeminiStreamToClaudeEvents::new("msg_1", "gemini-3-pro");
        let (tx, mut rx) = tokio::sync::mpsc::channel(8);
        let chunk = antigate_protocol::gemini::types::GenerateContentResponse {
            candidates: vec![Candidate {
                content: Content { role: None, parts: vec![Part::text("hi")] },
                finish_reason: None,
                index: Some(0),
            }],
            usage_metadata: None,
            model_version: None,
            response_id: None,
        };
        let data = serde_json::to_string(&chunk).unwrap();
        emit_bridge_events(&mut bridge, vec![SseEvent { event: None, data }], &tx).await;
        drop(tx);

        let mut frames = Vec::new();
        while let Some(chunk) = rx.recv().await {
            frames.push(String::from_utf8(chunk.frame.to_vec()).unwrap());
        }
        assert!(frames[0].starts_with("event: message_start"));
        assert!(frames.iter().any(|f| f.contains("content_block_delta") && f.contains("\"hi\"")));
    }
}
