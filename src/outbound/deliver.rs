//! Delivery orchestration.
//!
//! One call: persist to the write-ahead queue, resolve the channel handler,
//! normalize payloads, then for each payload drive chunking, hook
//! interception, and dispatch strictly in order. The queue record is resolved
//! exactly once when the call ends, whichever way it ends.

use crate::channels::traits::{OutboundDeliveryResult, OutboundIdentity, OutboundSendContext};
use crate::channels::ChannelRegistry;
use crate::config::OutboundConfig;
use crate::hooks::{HookContext, HookRunner, MessageMetadata};
use crate::outbound::chunk::ChunkUnit;
use crate::outbound::error::DeliveryError;
use crate::outbound::handler::ChannelHandler;
use crate::outbound::interception::{MessageInterceptor, Recovered, SendDecision};
use crate::outbound::mirror::{resolve_mirrored_transcript_text, MirrorSpec, TranscriptMirror};
use crate::outbound::payloads::{normalize_outbound_payloads, NormalizedOutboundPayload, ReplyPayload};
use crate::outbound::queue::{DeliveryQueue, QueueId, QueuedDelivery};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Queue failure reason when best-effort delivery swallowed at least one error.
pub const PARTIAL_FAILURE_REASON: &str = "partial delivery failure (bestEffort)";

const CANCELED_BY_HOOK: &str = "canceled by message_sending hook";

pub type PayloadObserver = Arc<dyn Fn(&NormalizedOutboundPayload) + Send + Sync>;
pub type ErrorObserver = Arc<dyn Fn(&anyhow::Error, &NormalizedOutboundPayload) + Send + Sync>;

/// Arguments of one delivery call.
#[derive(Clone, Default)]
pub struct DeliveryRequest {
    pub channel: String,
    pub to: String,
    pub payloads: Vec<ReplyPayload>,
    pub account_id: Option<String>,
    pub reply_to_id: Option<String>,
    pub thread_id: Option<String>,
    pub identity: Option<OutboundIdentity>,
    pub silent: bool,
    /// Continue past per-payload failures instead of aborting the call.
    pub best_effort: bool,
    /// Checked before every unit; an in-flight send is never interrupted.
    pub abort: Option<CancellationToken>,
    pub on_payload: Option<PayloadObserver>,
    pub on_error: Option<ErrorObserver>,
    pub mirror: Option<MirrorSpec>,
    /// Bypass the write-ahead queue. Set when replaying already-queued work.
    pub skip_queue: bool,
    pub session_key: Option<String>,
    pub session_id: Option<String>,
}

impl DeliveryRequest {
    pub fn new(
        channel: impl Into<String>,
        to: impl Into<String>,
        payloads: Vec<ReplyPayload>,
    ) -> Self {
        Self {
            channel: channel.into(),
            to: to.into(),
            payloads,
            ..Self::default()
        }
    }

    /// Rebuild a request from a queue record, for replay.
    pub fn from_queued(record: QueuedDelivery) -> Self {
        Self {
            channel: record.channel,
            to: record.to,
            payloads: record.payloads,
            account_id: record.account_id,
            reply_to_id: record.reply_to_id,
            thread_id: record.thread_id,
            identity: record.identity,
            silent: record.silent,
            best_effort: record.best_effort,
            mirror: record.mirror,
            session_key: record.session_key,
            session_id: record.session_id,
            ..Self::default()
        }
    }

    pub fn to_queued(&self) -> QueuedDelivery {
        QueuedDelivery {
            channel: self.channel.clone(),
            to: self.to.clone(),
            account_id: self.account_id.clone(),
            payloads: self.payloads.clone(),
            thread_id: self.thread_id.clone(),
            reply_to_id: self.reply_to_id.clone(),
            best_effort: self.best_effort,
            silent: self.silent,
            identity: self.identity.clone(),
            mirror: self.mirror.clone(),
            session_key: self.session_key.clone(),
            session_id: self.session_id.clone(),
        }
    }

    fn send_context(&self) -> OutboundSendContext {
        OutboundSendContext {
            to: self.to.clone(),
            account_id: self.account_id.clone(),
            reply_to_id: self.reply_to_id.clone(),
            thread_id: self.thread_id.clone(),
            identity: self.identity.clone(),
            silent: self.silent,
        }
    }

    fn is_aborted(&self) -> bool {
        self.abort
            .as_ref()
            .is_some_and(CancellationToken::is_cancelled)
    }
}

/// The delivery orchestrator. Collaborators are injected once at startup and
/// shared by every call.
#[derive(Clone)]
pub struct OutboundDelivery {
    registry: Arc<ChannelRegistry>,
    outbound: OutboundConfig,
    hooks: Option<Arc<HookRunner>>,
    queue: Option<Arc<dyn DeliveryQueue>>,
    mirror: Option<Arc<dyn TranscriptMirror>>,
}

impl OutboundDelivery {
    pub fn new(registry: Arc<ChannelRegistry>, outbound: OutboundConfig) -> Self {
        Self {
            registry,
            outbound,
            hooks: None,
            queue: None,
            mirror: None,
        }
    }

    pub fn with_hooks(mut self, hooks: Arc<HookRunner>) -> Self {
        self.hooks = Some(hooks);
        self
    }

    pub fn with_queue(mut self, queue: Arc<dyn DeliveryQueue>) -> Self {
        self.queue = Some(queue);
        self
    }

    pub fn with_mirror(mut self, mirror: Arc<dyn TranscriptMirror>) -> Self {
        self.mirror = Some(mirror);
        self
    }

    pub fn registry(&self) -> &ChannelRegistry {
        &self.registry
    }

    pub fn queue(&self) -> Option<&Arc<dyn DeliveryQueue>> {
        self.queue.as_ref()
    }

    /// Deliver `request.payloads` to `request.to` on `request.channel`.
    ///
    /// Returns one result per dispatched unit, in dispatch order. Strict mode
    /// fails on the first payload error; best-effort mode reports errors
    /// through `on_error` and returns what was delivered.
    pub async fn deliver(
        &self,
        request: DeliveryRequest,
    ) -> Result<Vec<OutboundDeliveryResult>, DeliveryError> {
        let queue_id = if request.skip_queue {
            None
        } else {
            self.enqueue(&request).await.settle("queue enqueue")
        };

        let outcome = self.deliver_core(&request).await;

        if let Some(id) = queue_id {
            let resolved = match &outcome {
                Ok((_, true)) => self.fail_queued(&id, PARTIAL_FAILURE_REASON).await,
                Ok((_, false)) => self.ack_queued(&id).await,
                Err(err) if err.is_abort() => self.ack_queued(&id).await,
                Err(err) => self.fail_queued(&id, &err.reason()).await,
            };
            resolved.settle("queue resolve");
        }

        match outcome {
            Ok((results, partial)) => {
                tracing::info!(
                    channel = %request.channel,
                    to = %request.to,
                    sent = results.len(),
                    partial,
                    "delivery finished"
                );
                Ok(results)
            }
            Err(err) => {
                tracing::warn!(
                    channel = %request.channel,
                    to = %request.to,
                    error = %err,
                    "delivery failed"
                );
                Err(err)
            }
        }
    }

    async fn enqueue(&self, request: &DeliveryRequest) -> Recovered<Option<QueueId>> {
        let Some(queue) = &self.queue else {
            return Recovered::Ok(None);
        };
        let outcome = queue.enqueue(&request.to_queued()).await.map(Some).map_err(|err| {
            err.context(format!(
                "enqueue failed, delivering without write-ahead record: channel={} to={}",
                request.channel, request.to
            ))
        });
        Recovered::from_result(outcome, || None)
    }

    async fn ack_queued(&self, id: &QueueId) -> Recovered<()> {
        let Some(queue) = &self.queue else {
            return Recovered::Ok(());
        };
        let outcome = queue
            .ack(id)
            .await
            .map_err(|err| err.context(format!("ack failed: queue_id={id}")));
        Recovered::from_result(outcome, || ())
    }

    async fn fail_queued(&self, id: &QueueId, reason: &str) -> Recovered<()> {
        let Some(queue) = &self.queue else {
            return Recovered::Ok(());
        };
        let outcome = queue
            .fail(id, reason)
            .await
            .map_err(|err| err.context(format!("fail failed: queue_id={id}")));
        Recovered::from_result(outcome, || ())
    }

    /// Returns the results and whether any payload failed under best-effort.
    async fn deliver_core(
        &self,
        request: &DeliveryRequest,
    ) -> Result<(Vec<OutboundDeliveryResult>, bool), DeliveryError> {
        let handler = ChannelHandler::resolve(
            &self.registry,
            &request.channel,
            request.send_context(),
            &self.outbound,
        )?;
        let interceptor = MessageInterceptor::new(
            self.hooks.clone(),
            &request.to,
            MessageMetadata {
                channel: request.channel.clone(),
                account_id: request.account_id.clone(),
                thread_id: request.thread_id.clone(),
            },
            HookContext {
                channel_id: request.channel.clone(),
                account_id: request.account_id.clone(),
                conversation_id: request.to.clone(),
                session_key: request.session_key.clone(),
                session_id: request.session_id.clone(),
            },
        );

        let payloads = normalize_outbound_payloads(&request.payloads, &request.channel);
        let mut run = DeliveryRun {
            request,
            handler,
            interceptor,
            results: Vec::new(),
            attempted: String::new(),
        };
        let mut partial = false;

        for (index, payload) in payloads.into_iter().enumerate() {
            run.attempted = payload.text.clone();
            match run.payload(payload.clone()).await {
                Ok(()) => {}
                Err(UnitError::Aborted) => return Err(DeliveryError::Aborted),
                Err(UnitError::Failed(err)) => {
                    let attempted = std::mem::take(&mut run.attempted);
                    run.report(&attempted, false, Some(format!("{err:#}"))).await;
                    if !request.best_effort {
                        return Err(DeliveryError::Send {
                            channel: request.channel.clone(),
                            payload_index: index,
                            error: err,
                        });
                    }
                    partial = true;
                    tracing::warn!(
                        channel = %request.channel,
                        to = %request.to,
                        payload_index = index,
                        error = %format!("{err:#}"),
                        "payload delivery failed; continuing (best effort)"
                    );
                    if let Some(on_error) = &request.on_error {
                        on_error(&err, &payload);
                    }
                }
            }
        }

        let results = run.results;
        if !results.is_empty() {
            if let Some(target) = &request.mirror {
                self.mirror_transcript(target).await.settle("transcript mirror");
            }
        }
        Ok((results, partial))
    }

    async fn mirror_transcript(&self, target: &MirrorSpec) -> Recovered<()> {
        let Some(mirror) = &self.mirror else {
            return Recovered::Ok(());
        };
        let Some(text) = resolve_mirrored_transcript_text(target.text.as_deref(), &target.media_urls)
        else {
            return Recovered::Ok(());
        };
        let outcome = mirror
            .append_assistant_message(target.agent_id.as_deref(), &target.session_key, &text)
            .await
            .map_err(|err| {
                err.context(format!(
                    "transcript mirror failed: session_key={}",
                    target.session_key
                ))
            });
        Recovered::from_result(outcome, || ())
    }
}

enum UnitError {
    Aborted,
    Failed(anyhow::Error),
}

impl From<anyhow::Error> for UnitError {
    fn from(err: anyhow::Error) -> Self {
        Self::Failed(err)
    }
}

/// State of one call while it walks the payload list.
struct DeliveryRun<'a> {
    request: &'a DeliveryRequest,
    handler: ChannelHandler,
    interceptor: MessageInterceptor,
    results: Vec<OutboundDeliveryResult>,
    /// Best-known content of the unit in flight, reported if the payload fails.
    attempted: String,
}

impl DeliveryRun<'_> {
    fn ensure_not_aborted(&self) -> Result<(), UnitError> {
        if self.request.is_aborted() {
            Err(UnitError::Aborted)
        } else {
            Ok(())
        }
    }

    /// Abort check for a unit whose `message_sending` already ran: the unit
    /// still gets its `message_sent` report.
    async fn ensure_not_aborted_after_hook(&self, content: &str) -> Result<(), UnitError> {
        if !self.request.is_aborted() {
            return Ok(());
        }
        self.report(content, false, Some(DeliveryError::Aborted.to_string()))
            .await;
        Err(UnitError::Aborted)
    }

    async fn before_send(&self, content: &str) -> SendDecision {
        self.interceptor
            .before_send(content)
            .await
            .settle("message_sending hook")
    }

    async fn report(&self, content: &str, success: bool, error: Option<String>) {
        self.interceptor
            .after_send(content, success, error)
            .await
            .settle("message_sent hook");
    }

    async fn payload(&mut self, payload: NormalizedOutboundPayload) -> Result<(), UnitError> {
        self.ensure_not_aborted()?;
        if let Some(on_payload) = &self.request.on_payload {
            on_payload(&payload);
        }

        if self.handler.supports_payload() && payload.channel_data.is_some() {
            return self.channel_payload(payload).await;
        }
        if payload.media_urls.is_empty() {
            return self.text(&payload.text).await;
        }
        self.media(payload).await
    }

    /// Whole payload through the adapter's payload path; hooks see its text.
    async fn channel_payload(
        &mut self,
        mut payload: NormalizedOutboundPayload,
    ) -> Result<(), UnitError> {
        let content = match self.before_send(&payload.text).await {
            SendDecision::Cancel(reason) => {
                self.report(&payload.text, false, Some(cancel_reason(&reason)))
                    .await;
                return Ok(());
            }
            SendDecision::Send(content) => content,
        };
        payload.text = content;
        self.attempted = payload.text.clone();
        self.ensure_not_aborted_after_hook(&payload.text).await?;

        let result = self.handler.send_payload(&payload).await?;
        self.results.push(result);
        self.report(&payload.text, true, None).await;
        Ok(())
    }

    async fn text(&mut self, text: &str) -> Result<(), UnitError> {
        let units = self.handler.plan().units(text);
        if units.is_empty() {
            tracing::debug!(
                channel = self.handler.channel(),
                "payload has no text to send"
            );
            return Ok(());
        }

        for unit in units {
            self.ensure_not_aborted()?;
            self.attempted = unit.text.clone();
            let content = match self.before_send(&unit.text).await {
                SendDecision::Cancel(reason) => {
                    self.report(&unit.text, false, Some(cancel_reason(&reason)))
                        .await;
                    continue;
                }
                SendDecision::Send(content) => content,
            };

            let dispatch: Vec<ChunkUnit> = if content == unit.text {
                vec![unit]
            } else {
                self.handler.plan().units(&content)
            };
            if dispatch.is_empty() {
                self.report(
                    &content,
                    false,
                    Some("message_sending hook left no content to send".into()),
                )
                .await;
                continue;
            }

            for sub in dispatch {
                self.attempted = sub.text.clone();
                self.ensure_not_aborted_after_hook(&sub.text).await?;
                tracing::debug!(
                    channel = self.handler.channel(),
                    chars = sub.text.chars().count(),
                    "dispatching text unit"
                );
                let result = self.handler.send_text(&sub).await?;
                self.results.push(result);
                self.report(&sub.text, true, None).await;
            }
        }
        Ok(())
    }

    /// Hooks run once on the caption; each URL is one unit, the first carrying
    /// the caption.
    async fn media(&mut self, payload: NormalizedOutboundPayload) -> Result<(), UnitError> {
        let caption_text = match self.before_send(&payload.text).await {
            SendDecision::Cancel(reason) => {
                self.report(&payload.text, false, Some(cancel_reason(&reason)))
                    .await;
                return Ok(());
            }
            SendDecision::Send(content) => content,
        };
        self.attempted = caption_text.clone();
        let caption = self.handler.caption_unit(&caption_text);

        for (index, url) in payload.media_urls.iter().enumerate() {
            let reported = if caption_text.is_empty() {
                url.clone()
            } else {
                caption_text.clone()
            };
            self.attempted = reported.clone();
            self.ensure_not_aborted_after_hook(&reported).await?;

            let unit_caption = if index == 0 {
                caption.clone()
            } else {
                ChunkUnit::default()
            };
            tracing::debug!(
                channel = self.handler.channel(),
                media_url = %url,
                "dispatching media unit"
            );
            let result = self.handler.send_media(&unit_caption, url).await?;
            self.results.push(result);
            self.report(&reported, true, None).await;
        }
        Ok(())
    }
}

fn cancel_reason(reason: &str) -> String {
    if reason.trim().is_empty() {
        CANCELED_BY_HOOK.to_string()
    } else {
        format!("{CANCELED_BY_HOOK}: {reason}")
    }
}
