//! Signaling protocol handler.
//!
//! Each inbound message is dispatched to a stateless handler. Session state
//! lives in the store; the hub tracks who owns a session and the PIN manager
//! gates the final answer retrieval.

use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, error, info, warn};

use crate::hub::{ConnectionId, Hub, Link};
use crate::pin::{self, PinManager};
use crate::protocol::{
    Ack, AnswerRecord, ClientMessage, GetAnswerRequest, MessageKind, OfferDetails, OfferRecord,
    ServerMessage, SessionRecord, SessionRequest, SignalError,
};
use crate::session_id::{pin_key, slot_key};
use crate::store::{SessionStore, StoreError};

/// Default TTL of offer, answer and PIN records in the store.
pub const DEFAULT_SESSION_TTL: Duration = Duration::from_secs(300);

/// The signaling protocol handler.
#[derive(Debug, Clone)]
pub struct SignalingHandler {
    hub: Arc<Hub>,
    pins: Arc<PinManager>,
    store: Arc<dyn SessionStore>,
    session_ttl: Duration,
}

impl SignalingHandler {
    pub fn new(
        hub: Arc<Hub>,
        pins: Arc<PinManager>,
        store: Arc<dyn SessionStore>,
        session_ttl: Duration,
    ) -> Self {
        Self {
            hub,
            pins,
            store,
            session_ttl,
        }
    }

    pub fn hub(&self) -> &Hub {
        &self.hub
    }

    /// Handle one raw text frame and produce the reply for its sender.
    pub async fn handle_text(&self, link: &Link, text: &str) -> ServerMessage {
        match serde_json::from_str::<ClientMessage>(text) {
            Ok(msg) => self.handle_message(link, msg).await,
            Err(e) => {
                debug!(connection = %link.id(), "Invalid frame: {}", e);
                ServerMessage::error(&SignalError::InvalidMessage(e.to_string()))
            }
        }
    }

    /// Handle a single client message.
    pub async fn handle_message(&self, link: &Link, msg: ClientMessage) -> ServerMessage {
        match self.dispatch(link, msg).await {
            Ok(payload) => ServerMessage::Ok(payload),
            Err(err) => {
                debug!(connection = %link.id(), %err, "Request failed");
                ServerMessage::error(&err)
            }
        }
    }

    /// Release whatever `connection` owned. Called when its link closes.
    pub fn disconnect(&self, connection: ConnectionId) {
        if let Some(session_id) = self.hub.unregister(connection) {
            info!(%connection, %session_id, "Initiator disconnected");
        }
    }

    async fn dispatch(&self, link: &Link, msg: ClientMessage) -> Result<Value, SignalError> {
        match MessageKind::parse(&msg.kind) {
            Some(MessageKind::Offer) => {
                let offer: OfferRecord = decode(msg.payload)?;
                reply(&self.handle_offer(link, offer).await?)
            }
            Some(MessageKind::GetOffer) => {
                let request: SessionRequest = decode(msg.payload)?;
                reply(&self.handle_get_offer(request).await?)
            }
            Some(MessageKind::Answer) => {
                let answer: AnswerRecord = decode(msg.payload)?;
                reply(&self.handle_answer(answer).await?)
            }
            Some(MessageKind::GetAnswer) => {
                let request: GetAnswerRequest = decode(msg.payload)?;
                reply(&self.handle_get_answer(request).await?)
            }
            None => Err(SignalError::UnknownType(msg.kind)),
        }
    }

    /// Store an offer and bind its session id to the sending connection.
    async fn handle_offer(&self, link: &Link, offer: OfferRecord) -> Result<Ack, SignalError> {
        require_session_id(&offer.session_id)?;
        debug!(connection = %link.id(), session_id = %offer.session_id, "Offer");

        if self.hub.has_active_session(link.id()) {
            return Err(SignalError::AlreadyActive);
        }

        let session_id = offer.session_id.clone();
        let raw = encode(&SessionRecord::Offered(offer))?;
        if let Err(err) = self
            .store
            .set(&slot_key(&session_id), raw, self.session_ttl)
            .await
        {
            error!(%session_id, %err, "Cannot save the offer");
            return Err(SignalError::SaveOffer);
        }

        self.hub.register(link.clone(), &session_id);
        info!(connection = %link.id(), %session_id, "Session offered");

        Ok(Ack::ok())
    }

    /// Return the stored offer of a session.
    async fn handle_get_offer(&self, request: SessionRequest) -> Result<OfferDetails, SignalError> {
        require_session_id(&request.session_id)?;
        debug!(session_id = %request.session_id, "Get offer");

        match self.load(&request.session_id).await? {
            Some(SessionRecord::Offered(offer)) => Ok(offer.into()),
            // Already answered: the offer is no longer available
            Some(SessionRecord::Answered(_)) | None => Err(SignalError::SessionNotFound),
        }
    }

    /// Accept an answer, issue a PIN and notify the initiator.
    async fn handle_answer(&self, answer: AnswerRecord) -> Result<Ack, SignalError> {
        require_session_id(&answer.session_id)?;
        let session_id = answer.session_id.clone();
        debug!(%session_id, "Answer");

        let initiator = self
            .hub
            .lookup(&session_id)
            .ok_or(SignalError::PeerNotFound)?;
        let raw = encode(&SessionRecord::Answered(answer))?;

        let pin = self.pins.generate().map_err(|err| {
            warn!(%session_id, %err, "PIN generation failed");
            SignalError::PinGeneration
        })?;

        // The store copy must not outlive the PIN itself
        let pin_ttl = self.session_ttl.min(self.pins.expiry());
        if let Err(err) = self
            .store
            .set(&pin_key(&session_id), pin.clone(), pin_ttl)
            .await
        {
            error!(%session_id, %err, "Cannot save the PIN");
            self.pins.remove(&pin);
            return Err(SignalError::SavePin);
        }

        if let Err(err) = self
            .store
            .set(&slot_key(&session_id), raw, self.session_ttl)
            .await
        {
            error!(%session_id, %err, "Cannot save the answer");
            self.pins.remove(&pin);
            return Err(SignalError::SaveAnswer);
        }

        self.hub.broadcast(initiator, ServerMessage::confirm_connection());
        info!(%session_id, "Session answered");

        Ok(Ack::with_pin(pin))
    }

    /// Return the stored answer if the PIN matches.
    async fn handle_get_answer(
        &self,
        request: GetAnswerRequest,
    ) -> Result<AnswerRecord, SignalError> {
        require_session_id(&request.session_id)?;
        let session_id = &request.session_id;
        debug!(%session_id, "Get answer");

        if !pin::is_well_formed(&request.pin) {
            warn!(%session_id, "Malformed PIN");
            return Err(SignalError::InvalidPin);
        }

        let stored_pin = match self.store.get(&pin_key(session_id)).await {
            Ok(pin) => Some(pin),
            Err(StoreError::NotFound) => None,
            Err(err) => {
                error!(%session_id, %err, "Cannot read the PIN");
                None
            }
        };
        if stored_pin.as_deref() != Some(request.pin.as_str()) {
            warn!(%session_id, "Invalid PIN");
            return Err(SignalError::InvalidPin);
        }

        match self.load(session_id).await? {
            Some(SessionRecord::Answered(answer)) => {
                info!(%session_id, "Answer retrieved");
                Ok(answer)
            }
            Some(SessionRecord::Offered(_)) | None => Err(SignalError::AnswerNotFound),
        }
    }

    /// Read and decode the slot of a session. `None` if absent or expired.
    async fn load(&self, session_id: &str) -> Result<Option<SessionRecord>, SignalError> {
        let raw = match self.store.get(&slot_key(session_id)).await {
            Ok(raw) => raw,
            Err(StoreError::NotFound) => return Ok(None),
            Err(err) => {
                error!(%session_id, %err, "Cannot read session");
                return Err(SignalError::Internal);
            }
        };

        serde_json::from_str(&raw).map(Some).map_err(|err| {
            error!(%session_id, %err, "Malformed session record");
            SignalError::Internal
        })
    }
}

fn require_session_id(session_id: &str) -> Result<(), SignalError> {
    if session_id.is_empty() {
        return Err(SignalError::InvalidMessage(
            "sessionId must not be empty".to_string(),
        ));
    }
    Ok(())
}

fn decode<T: DeserializeOwned>(payload: Value) -> Result<T, SignalError> {
    serde_json::from_value(payload).map_err(|e| SignalError::InvalidMessage(e.to_string()))
}

fn encode(record: &SessionRecord) -> Result<String, SignalError> {
    serde_json::to_string(record).map_err(|err| {
        error!(%err, "Cannot serialize session record");
        SignalError::Internal
    })
}

fn reply<T: Serialize>(payload: &T) -> Result<Value, SignalError> {
    serde_json::to_value(payload).map_err(|err| {
        error!(%err, "Cannot serialize response");
        SignalError::Internal
    })
}
