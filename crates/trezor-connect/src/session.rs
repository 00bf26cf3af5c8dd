//! Request/response exchange with one device, including the prompts the
//! device interleaves before its final answer.

use std::sync::Arc;

use async_trait::async_trait;
use hw_codec::RawMessage;
use rand::RngCore;
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::error::{DeviceError, Result};
use crate::link::Link;
use crate::messages::{
    ButtonAck, ButtonRequest, Cancel, DeviceMessage, EntropyAck, Failure, PassphraseAck,
    PassphraseRequest, PassphraseStateAck, PassphraseStateRequest, PinMatrixAck,
    PinMatrixRequest, WordAck, WordRequest,
};
use crate::registry::MessageRegistry;
use crate::transport::Transport;

pub const DEFAULT_ENTROPY_LEN: usize = 32;

/// Where a device `Failure` goes while a request is pending.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum FailureRoute {
    /// Only the caller sees it, as the request's error.
    Caller,
    /// The prompt handler is notified as well.
    Subscribers,
}

/// Notifications that need no answer from the application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceEvent {
    /// The device waits for a physical confirmation; acknowledged automatically.
    Button { code: Option<i32>, pages: Option<u32> },
    Failure { code: Option<i32>, message: String },
    Disconnected,
}

/// Device requests that need user input relayed by the application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DevicePrompt {
    PinMatrix { kind: Option<i32> },
    Passphrase { on_device: bool },
    Word { kind: Option<i32> },
}

impl DevicePrompt {
    pub fn name(&self) -> &'static str {
        match self {
            Self::PinMatrix { .. } => "PinMatrixRequest",
            Self::Passphrase { .. } => "PassphraseRequest",
            Self::Word { .. } => "WordRequest",
        }
    }
}

#[derive(Clone, PartialEq, Eq)]
pub enum PromptReply {
    /// Scrambled PIN as positions on the device's matrix.
    Pin(String),
    Passphrase(String),
    /// Let the user type the passphrase on the device itself.
    PassphraseOnDevice,
    Word(String),
    Cancel,
}

impl PromptReply {
    fn kind(&self) -> &'static str {
        match self {
            Self::Pin(_) => "pin",
            Self::Passphrase(_) | Self::PassphraseOnDevice => "passphrase",
            Self::Word(_) => "word",
            Self::Cancel => "cancel",
        }
    }
}

// Replies carry secrets; keep them out of logs.
impl std::fmt::Debug for PromptReply {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "PromptReply({})", self.kind())
    }
}

/// Application side of the device's interactive prompts.
#[async_trait]
pub trait PromptHandler: Send + Sync {
    fn on_event(&self, _event: &DeviceEvent) {}

    async fn on_prompt(&self, prompt: DevicePrompt) -> std::result::Result<PromptReply, String>;
}

/// One device conversation: a transport, the schema, and the pending slot.
///
/// Every request borrows the session mutably until its terminal response
/// arrives, so top-level requests cannot overlap.
pub struct DeviceSession<L> {
    transport: Option<Transport<L>>,
    registry: MessageRegistry,
    handler: Option<Arc<dyn PromptHandler>>,
    pending: Option<&'static str>,
    passphrase_state: Option<Vec<u8>>,
    entropy_len: usize,
}

impl<L: Link> DeviceSession<L> {
    pub fn new(registry: MessageRegistry) -> Self {
        Self {
            transport: None,
            registry,
            handler: None,
            pending: None,
            passphrase_state: None,
            entropy_len: DEFAULT_ENTROPY_LEN,
        }
    }

    pub fn with_transport(transport: Transport<L>, registry: MessageRegistry) -> Self {
        let mut session = Self::new(registry);
        session.transport = Some(transport);
        session
    }

    /// Installs a transport, returning the previous one.
    pub fn attach(&mut self, transport: Transport<L>) -> Option<Transport<L>> {
        self.pending = None;
        self.transport.replace(transport)
    }

    pub fn detach(&mut self) -> Option<Transport<L>> {
        self.pending = None;
        self.transport.take()
    }

    pub fn transport(&self) -> Option<&Transport<L>> {
        self.transport.as_ref()
    }

    pub fn registry(&self) -> &MessageRegistry {
        &self.registry
    }

    pub fn is_open(&self) -> bool {
        self.transport.as_ref().is_some_and(Transport::is_open)
    }

    pub fn disconnect_notifications(&self) -> Option<watch::Receiver<bool>> {
        self.transport
            .as_ref()
            .map(Transport::disconnect_notifications)
    }

    pub fn set_prompt_handler(&mut self, handler: Arc<dyn PromptHandler>) {
        self.handler = Some(handler);
    }

    pub fn clear_prompt_handler(&mut self) {
        self.handler = None;
    }

    pub fn set_entropy_len(&mut self, len: usize) {
        self.entropy_len = len;
    }

    /// State token from the last `PassphraseStateRequest`.
    pub fn passphrase_state(&self) -> Option<&[u8]> {
        self.passphrase_state.as_deref()
    }

    /// Expected response name of an exchange that was started and never
    /// finished (its future was dropped).
    pub fn pending(&self) -> Option<&'static str> {
        self.pending
    }

    /// Sends `request` and waits for `Resp`, notifying the prompt handler of
    /// device failures.
    pub async fn call<Req, Resp>(&mut self, request: &Req) -> Result<Resp>
    where
        Req: DeviceMessage,
        Resp: DeviceMessage,
    {
        self.call_with(request, FailureRoute::Subscribers).await
    }

    pub async fn call_with<Req, Resp>(&mut self, request: &Req, route: FailureRoute) -> Result<Resp>
    where
        Req: DeviceMessage,
        Resp: DeviceMessage,
    {
        self.transport_mut()?;
        if let Some(stale) = self.pending {
            warn!(expected = stale, "previous exchange was abandoned; cancel it first");
            return Err(DeviceError::Busy);
        }
        let raw = self.registry.encode(request)?;

        self.pending = Some(Resp::NAME);
        let result = self.exchange(raw, Req::NAME, Resp::NAME, route).await;
        self.pending = None;

        if matches!(result, Err(DeviceError::DeviceDisconnected)) {
            self.emit(&DeviceEvent::Disconnected);
        }
        self.registry.decode(&result?)
    }

    /// Asks the device to abort its current operation and consumes the
    /// `Failure` it answers with, so the next request starts clean.
    ///
    /// A request in flight holds the session borrow, so `cancel` only runs
    /// between requests: either idle, or after a call future was dropped
    /// mid-exchange. In the latter case whatever the abandoned exchange still
    /// delivers is discarded along the way.
    pub async fn cancel(&mut self) -> Result<()> {
        self.send(&Cancel {}).await?;
        let abandoned = self.pending.take();
        loop {
            let raw = self.receive().await?;
            let name = self.registry.name_of(raw.message_type)?;
            if name == "Failure" {
                debug!(abandoned = ?abandoned, "device confirmed cancel");
                return Ok(());
            }
            debug!(name, abandoned = ?abandoned, "discarding message ahead of cancel answer");
        }
    }

    async fn exchange(
        &mut self,
        request: RawMessage,
        request_name: &'static str,
        expected: &'static str,
        route: FailureRoute,
    ) -> Result<RawMessage> {
        self.send_raw(request_name, &request).await?;
        loop {
            let raw = self.receive().await?;
            let name = self.registry.name_of(raw.message_type)?;
            match name {
                "Failure" => {
                    let failure: Failure = self.registry.decode(&raw)?;
                    return Err(self.device_failed(failure, route));
                }
                "ButtonRequest" => {
                    let request: ButtonRequest = self.registry.decode(&raw)?;
                    debug!(code = ?request.code, "button request, acknowledging");
                    self.emit(&DeviceEvent::Button {
                        code: request.code,
                        pages: request.pages,
                    });
                    self.send(&ButtonAck {}).await?;
                }
                "EntropyRequest" => {
                    debug!(len = self.entropy_len, "entropy request, acknowledging");
                    let entropy = random_bytes(self.entropy_len);
                    self.send(&EntropyAck { entropy }).await?;
                }
                "PassphraseStateRequest" => {
                    let request: PassphraseStateRequest = self.registry.decode(&raw)?;
                    debug!("passphrase state recorded");
                    self.passphrase_state = request.state;
                    self.send(&PassphraseStateAck {}).await?;
                }
                "PinMatrixRequest" => {
                    let request: PinMatrixRequest = self.registry.decode(&raw)?;
                    self.answer_prompt(DevicePrompt::PinMatrix {
                        kind: request.r#type,
                    })
                    .await?;
                }
                "PassphraseRequest" => {
                    let request: PassphraseRequest = self.registry.decode(&raw)?;
                    self.answer_prompt(DevicePrompt::Passphrase {
                        on_device: request.on_device.unwrap_or(false),
                    })
                    .await?;
                }
                "WordRequest" => {
                    let request: WordRequest = self.registry.decode(&raw)?;
                    self.answer_prompt(DevicePrompt::Word {
                        kind: request.r#type,
                    })
                    .await?;
                }
                _ if name == expected => return Ok(raw),
                _ => {
                    return Err(DeviceError::UnexpectedResponse {
                        expected,
                        actual: name.to_string(),
                    })
                }
            }
        }
    }

    async fn answer_prompt(&mut self, prompt: DevicePrompt) -> Result<()> {
        debug!(prompt = prompt.name(), "device prompt");
        let Some(handler) = self.handler.clone() else {
            warn!(prompt = prompt.name(), "no prompt handler installed, cancelling");
            self.abort_exchange().await;
            return Err(DeviceError::PromptUnhandled(prompt.name()));
        };

        let reply = match handler.on_prompt(prompt.clone()).await {
            Ok(reply) => reply,
            Err(reason) => {
                self.abort_exchange().await;
                return Err(DeviceError::PromptRejected(reason));
            }
        };

        match (&prompt, reply) {
            (_, PromptReply::Cancel) => self.send(&Cancel {}).await,
            (DevicePrompt::PinMatrix { .. }, PromptReply::Pin(pin)) => {
                self.send(&PinMatrixAck { pin }).await
            }
            (DevicePrompt::Passphrase { .. }, PromptReply::Passphrase(passphrase)) => {
                self.send(&PassphraseAck {
                    passphrase: Some(passphrase),
                    on_device: None,
                })
                .await
            }
            (DevicePrompt::Passphrase { .. }, PromptReply::PassphraseOnDevice) => {
                self.send(&PassphraseAck {
                    passphrase: None,
                    on_device: Some(true),
                })
                .await
            }
            (DevicePrompt::Word { .. }, PromptReply::Word(word)) => {
                self.send(&WordAck { word }).await
            }
            (prompt, reply) => {
                self.abort_exchange().await;
                Err(DeviceError::PromptRejected(format!(
                    "{} reply does not answer {}",
                    reply.kind(),
                    prompt.name()
                )))
            }
        }
    }

    /// Cancels on the device and swallows its `Failure` answer.
    async fn abort_exchange(&mut self) {
        if let Err(error) = self.send(&Cancel {}).await {
            warn!(%error, "failed to send cancel");
            return;
        }
        match self.receive().await {
            Ok(raw) => match self.registry.name_of(raw.message_type) {
                Ok("Failure") => debug!("device confirmed cancel"),
                Ok(name) => warn!(name, "unexpected answer to cancel"),
                Err(error) => warn!(%error, "unknown answer to cancel"),
            },
            Err(error) => warn!(%error, "no answer to cancel"),
        }
    }

    fn device_failed(&self, failure: Failure, route: FailureRoute) -> DeviceError {
        let code = failure.code;
        let message = failure
            .message
            .unwrap_or_else(|| "device reported failure".to_string());
        debug!(?code, %message, ?route, "device failure");
        if route == FailureRoute::Subscribers {
            self.emit(&DeviceEvent::Failure {
                code,
                message: message.clone(),
            });
        }
        DeviceError::DeviceFailure { code, message }
    }

    fn emit(&self, event: &DeviceEvent) {
        if let Some(handler) = &self.handler {
            handler.on_event(event);
        }
    }

    fn transport_mut(&mut self) -> Result<&mut Transport<L>> {
        let transport = self.transport.as_mut().ok_or(DeviceError::NoTransport)?;
        if !transport.is_open() {
            return Err(DeviceError::NotSelected);
        }
        Ok(transport)
    }

    async fn send<M: DeviceMessage>(&mut self, message: &M) -> Result<()> {
        let raw = self.registry.encode(message)?;
        self.send_raw(M::NAME, &raw).await
    }

    async fn send_raw(&mut self, name: &'static str, raw: &RawMessage) -> Result<()> {
        debug!(
            message_type = raw.message_type,
            name,
            payload_len = raw.payload.len(),
            "device TX"
        );
        self.transport_mut()?.send(raw).await
    }

    async fn receive(&mut self) -> Result<RawMessage> {
        let raw = self.transport_mut()?.receive().await?;
        debug!(
            message_type = raw.message_type,
            name = self.registry.name_of(raw.message_type).unwrap_or("?"),
            payload_len = raw.payload.len(),
            "device RX"
        );
        Ok(raw)
    }
}

fn random_bytes(len: usize) -> Vec<u8> {
    let mut bytes = vec![0u8; len];
    rand::rng().fill_bytes(&mut bytes);
    bytes
}
