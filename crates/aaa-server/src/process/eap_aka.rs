//! EAP-AKA process module
//!
//! Drives the EAP-AKA conversation for virtual servers in the `eap-aka`
//! namespace. Every step of the conversation runs a processing section
//! (`recv Identity-Response`, `send Challenge-Request`, ...) so operators
//! can attach policy to any of them; steps without policy fall back to the
//! section's default result.
//!
//! The peer's step is taken from `&Subtype`; the next step is written to
//! `&reply.Subtype` (or `&reply.EAP-Code` once the conversation ends).
//! The request result is `handled` while the conversation continues, `ok`
//! on success and `reject` on failure.

use crate::dispatch::Dispatcher;
use crate::error::DispatchError;
use crate::lifecycle::VirtualServer;
use crate::protocol::{parse_settings, section_id, ProtocolError, ProtocolInstance, ProtocolModule};
use crate::request::Request;
use crate::section::{MethodName, SectionId, SectionRef, SectionRegistry, SectionSpec, IDENT_ANY};
use aaa_proto::{DataType, DictError, Dictionary, ModActions, RCode};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, info, warn};

pub const NAMESPACE: &str = "eap-aka";

const AUTHORIZE: ModActions = ModActions::authorize();
const REJECTING: ModActions = ModActions::authorize().with_default(RCode::Reject);

static PROTOCOL_METHODS: [MethodName; 1] = [MethodName::new("group", IDENT_ANY)];
static STORE_SESSION: [MethodName; 1] = [MethodName::new("store", "session")];
static LOAD_SESSION: [MethodName; 1] = [MethodName::new("load", "session")];
static CLEAR_SESSION: [MethodName; 1] = [MethodName::new("clear", "session")];
static STORE_PSEUDONYM: [MethodName; 1] = [MethodName::new("store", "pseudonym")];
static LOAD_PSEUDONYM: [MethodName; 1] = [MethodName::new("load", "pseudonym")];
static CLEAR_PSEUDONYM: [MethodName; 1] = [MethodName::new("clear", "pseudonym")];

static SECTIONS: [SectionSpec; 23] = [
    // Identity negotiation
    SectionSpec::new("recv", "Identity-Response", AUTHORIZE),
    SectionSpec::new("send", "Identity-Request", AUTHORIZE),
    SectionSpec::new("send", "AKA-Identity-Request", AUTHORIZE),
    SectionSpec::new("recv", "AKA-Identity-Response", AUTHORIZE),
    // Full authentication
    SectionSpec::new("send", "Challenge-Request", AUTHORIZE),
    SectionSpec::new("recv", "Challenge-Response", AUTHORIZE),
    // Fast re-authentication
    SectionSpec::new("send", "Reauthentication-Request", AUTHORIZE),
    SectionSpec::new("recv", "Reauthentication-Response", AUTHORIZE),
    // Peer failures
    SectionSpec::new("recv", "Client-Error", REJECTING),
    SectionSpec::new("recv", "Authentication-Reject", REJECTING),
    SectionSpec::new("recv", "Synchronization-Failure", REJECTING),
    // Notifications
    SectionSpec::new("send", "Failure-Notification", AUTHORIZE),
    SectionSpec::new("recv", "Failure-Notification-ACK", AUTHORIZE),
    SectionSpec::new("send", "Success-Notification", AUTHORIZE),
    SectionSpec::new("recv", "Success-Notification-ACK", AUTHORIZE),
    // Final EAP codes
    SectionSpec::new("send", "EAP-Success", AUTHORIZE),
    SectionSpec::new("send", "EAP-Failure", AUTHORIZE),
    // Fast re-authentication state
    SectionSpec::new("store", "session", AUTHORIZE).with_methods(&STORE_SESSION),
    SectionSpec::new("load", "session", AUTHORIZE).with_methods(&LOAD_SESSION),
    SectionSpec::new("clear", "session", AUTHORIZE).with_methods(&CLEAR_SESSION),
    // Pseudonyms
    SectionSpec::new("store", "pseudonym", AUTHORIZE).with_methods(&STORE_PSEUDONYM),
    SectionSpec::new("load", "pseudonym", AUTHORIZE).with_methods(&LOAD_PSEUDONYM),
    SectionSpec::new("clear", "pseudonym", AUTHORIZE).with_methods(&CLEAR_PSEUDONYM),
];

static ID_SEQUENCE: AtomicU64 = AtomicU64::new(0);

/// Which identity to ask for after the EAP-Identity exchange
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdentityRequest {
    /// Use the EAP-Identity as is
    #[default]
    None,
    Any,
    Fullauth,
    Permanent,
    /// Not valid for EAP-AKA; treated as `none`
    Init,
}

impl IdentityRequest {
    fn as_str(self) -> &'static str {
        match self {
            IdentityRequest::None => "none",
            IdentityRequest::Any => "any",
            IdentityRequest::Fullauth => "fullauth",
            IdentityRequest::Permanent => "permanent",
            IdentityRequest::Init => "init",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AkaSettings {
    #[serde(default)]
    pub request_identity: IdentityRequest,
    #[serde(default = "default_strip_hint")]
    pub strip_permanent_identity_hint: bool,
    #[serde(default = "default_ephemeral_id_length")]
    pub ephemeral_id_length: usize,
    #[serde(default)]
    pub protected_success: bool,
}

fn default_strip_hint() -> bool {
    true
}

fn default_ephemeral_id_length() -> usize {
    14
}

impl Default for AkaSettings {
    fn default() -> Self {
        AkaSettings {
            request_identity: IdentityRequest::None,
            strip_permanent_identity_hint: default_strip_hint(),
            ephemeral_id_length: default_ephemeral_id_length(),
            protected_success: false,
        }
    }
}

/// Kind of identity, from its leading hint character
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum IdentityKind {
    Permanent,
    Pseudonym,
    Fastauth,
    Unknown,
}

impl IdentityKind {
    fn of(identity: &str) -> IdentityKind {
        match identity.as_bytes().first() {
            Some(b'0') => IdentityKind::Permanent,
            Some(b'2') => IdentityKind::Pseudonym,
            Some(b'4') => IdentityKind::Fastauth,
            _ => IdentityKind::Unknown,
        }
    }
}

/// The EAP-AKA protocol module
pub struct EapAka;

impl ProtocolModule for EapAka {
    fn name(&self) -> &'static str {
        "eap_aka"
    }

    fn dict(&self) -> Result<Dictionary, DictError> {
        Dictionary::new(NAMESPACE)
            .with_attr("Subtype", 1, DataType::String)?
            .with_attr("Identity", 2, DataType::String)?
            .with_attr("Permanent-Identity", 3, DataType::String)?
            .with_attr("Identity-Request-Type", 4, DataType::String)?
            .with_attr("Notification", 5, DataType::String)?
            .with_attr("Client-Error-Code", 6, DataType::Integer)?
            .with_attr("Next-Pseudonym", 7, DataType::String)?
            .with_attr("Next-Reauth-Id", 8, DataType::String)?
            .with_attr("Session-Id", 9, DataType::Octets)?
            .with_attr("EAP-Code", 10, DataType::String)?
            .with_attr("User-Name", 11, DataType::String)?
            .with_attr("Reply-Message", 12, DataType::String)
    }

    fn sections(&self) -> &'static [SectionSpec] {
        &SECTIONS
    }

    fn methods(&self) -> &'static [MethodName] {
        &PROTOCOL_METHODS
    }

    fn onload(&self) -> Result<(), ProtocolError> {
        let seed = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.as_nanos() as u64)
            .unwrap_or_default();
        ID_SEQUENCE.store(seed, Ordering::Relaxed);
        debug!("EAP-AKA identity sequence seeded");
        Ok(())
    }

    fn unload(&self) {
        debug!("EAP-AKA unloaded");
    }

    fn bootstrap(
        &self,
        server: &str,
        settings: &serde_json::Value,
    ) -> Result<Box<dyn ProtocolInstance>, ProtocolError> {
        let settings: AkaSettings = parse_settings(self.name(), settings)?;
        if settings.ephemeral_id_length == 0 {
            return Err(ProtocolError::Settings {
                protocol: self.name().to_string(),
                reason: "ephemeral_id_length must be at least 1".to_string(),
            });
        }
        debug!(server = %server, ?settings, "Bootstrapped EAP-AKA");
        Ok(Box::new(AkaInstance {
            settings,
            sections: None,
        }))
    }
}

#[derive(Debug, Clone, Copy)]
struct AkaSections {
    recv_identity_response: SectionId,
    send_identity_request: SectionId,
    send_aka_identity_request: SectionId,
    recv_aka_identity_response: SectionId,
    send_challenge_request: SectionId,
    recv_challenge_response: SectionId,
    send_reauthentication_request: SectionId,
    recv_reauthentication_response: SectionId,
    recv_client_error: SectionId,
    recv_authentication_reject: SectionId,
    recv_synchronization_failure: SectionId,
    send_failure_notification: SectionId,
    recv_failure_notification_ack: SectionId,
    send_success_notification: SectionId,
    recv_success_notification_ack: SectionId,
    send_eap_success: SectionId,
    send_eap_failure: SectionId,
    store_session: SectionId,
    load_session: SectionId,
    clear_session: SectionId,
    store_pseudonym: SectionId,
    load_pseudonym: SectionId,
    clear_pseudonym: SectionId,
}

impl AkaSections {
    fn resolve(registry: &SectionRegistry) -> Result<Self, ProtocolError> {
        Ok(AkaSections {
            recv_identity_response: section_id(registry, "recv", "Identity-Response")?,
            send_identity_request: section_id(registry, "send", "Identity-Request")?,
            send_aka_identity_request: section_id(registry, "send", "AKA-Identity-Request")?,
            recv_aka_identity_response: section_id(registry, "recv", "AKA-Identity-Response")?,
            send_challenge_request: section_id(registry, "send", "Challenge-Request")?,
            recv_challenge_response: section_id(registry, "recv", "Challenge-Response")?,
            send_reauthentication_request: section_id(registry, "send", "Reauthentication-Request")?,
            recv_reauthentication_response: section_id(registry, "recv", "Reauthentication-Response")?,
            recv_client_error: section_id(registry, "recv", "Client-Error")?,
            recv_authentication_reject: section_id(registry, "recv", "Authentication-Reject")?,
            recv_synchronization_failure: section_id(registry, "recv", "Synchronization-Failure")?,
            send_failure_notification: section_id(registry, "send", "Failure-Notification")?,
            recv_failure_notification_ack: section_id(registry, "recv", "Failure-Notification-ACK")?,
            send_success_notification: section_id(registry, "send", "Success-Notification")?,
            recv_success_notification_ack: section_id(registry, "recv", "Success-Notification-ACK")?,
            send_eap_success: section_id(registry, "send", "EAP-Success")?,
            send_eap_failure: section_id(registry, "send", "EAP-Failure")?,
            store_session: section_id(registry, "store", "session")?,
            load_session: section_id(registry, "load", "session")?,
            clear_session: section_id(registry, "clear", "session")?,
            store_pseudonym: section_id(registry, "store", "pseudonym")?,
            load_pseudonym: section_id(registry, "load", "pseudonym")?,
            clear_pseudonym: section_id(registry, "clear", "pseudonym")?,
        })
    }
}

/// EAP-AKA state for one virtual server
pub struct AkaInstance {
    settings: AkaSettings,
    sections: Option<AkaSections>,
}

/// One step of the conversation
struct Step<'a, 'd> {
    dispatcher: &'a Dispatcher<'d>,
    server: &'a VirtualServer,
    sections: AkaSections,
    settings: &'a AkaSettings,
}

impl Step<'_, '_> {
    async fn run(&self, request: &mut Request, id: SectionId) -> RCode {
        self.dispatcher
            .call(request, self.server, &SectionRef::fixed(id))
            .await
    }

    async fn start(&self, request: &mut Request) -> RCode {
        let rcode = self.run(request, self.sections.send_identity_request).await;
        if !rcode.is_success() {
            return self.eap_failure(request).await;
        }
        request.reply.set("Subtype", "Identity");
        RCode::Handled
    }

    async fn identity_response(&self, request: &mut Request) -> RCode {
        let rcode = self.run(request, self.sections.recv_identity_response).await;
        if !rcode.is_success() {
            return self.failure_notification(request).await;
        }

        let identity = request.request.get("Identity").unwrap_or_default().to_string();
        let kind = IdentityKind::of(&identity);
        let wanted = match self.settings.request_identity {
            IdentityRequest::None | IdentityRequest::Init => None,
            IdentityRequest::Any => Some(IdentityRequest::Any),
            IdentityRequest::Fullauth if kind == IdentityKind::Fastauth => Some(IdentityRequest::Fullauth),
            IdentityRequest::Permanent if kind != IdentityKind::Permanent => Some(IdentityRequest::Permanent),
            IdentityRequest::Fullauth | IdentityRequest::Permanent => None,
        };

        match wanted {
            Some(kind) => self.identity_request(request, kind).await,
            None => self.authenticate_identity(request, &identity).await,
        }
    }

    async fn identity_request(&self, request: &mut Request, kind: IdentityRequest) -> RCode {
        request.reply.set("Identity-Request-Type", kind.as_str());
        let rcode = self.run(request, self.sections.send_aka_identity_request).await;
        if !rcode.is_success() {
            return self.failure_notification(request).await;
        }
        request.reply.set("Subtype", "AKA-Identity");
        RCode::Handled
    }

    async fn aka_identity_response(&self, request: &mut Request) -> RCode {
        let rcode = self.run(request, self.sections.recv_aka_identity_response).await;
        if !rcode.is_success() {
            return self.failure_notification(request).await;
        }
        let identity = request.request.get("Identity").unwrap_or_default().to_string();
        self.authenticate_identity(request, &identity).await
    }

    /// Pick fast re-authentication or a full challenge for an identity
    async fn authenticate_identity(&self, request: &mut Request, identity: &str) -> RCode {
        match IdentityKind::of(identity) {
            IdentityKind::Fastauth => {
                let rcode = self.run(request, self.sections.load_session).await;
                if rcode.is_success() {
                    return self.reauthentication_request(request).await;
                }
                debug!(request = request.id, "No session to resume, falling back to full authentication");
                self.challenge_request(request).await
            }
            IdentityKind::Pseudonym => {
                let rcode = self.run(request, self.sections.load_pseudonym).await;
                if !rcode.is_success() {
                    return self.identity_request(request, IdentityRequest::Permanent).await;
                }
                self.challenge_request(request).await
            }
            IdentityKind::Permanent => {
                let permanent = if self.settings.strip_permanent_identity_hint {
                    &identity[1..]
                } else {
                    identity
                };
                request.control.set("Permanent-Identity", permanent);
                self.challenge_request(request).await
            }
            IdentityKind::Unknown => {
                request.control.set("Permanent-Identity", identity);
                self.challenge_request(request).await
            }
        }
    }

    async fn challenge_request(&self, request: &mut Request) -> RCode {
        let rcode = self.run(request, self.sections.send_challenge_request).await;
        if !rcode.is_success() {
            return self.failure_notification(request).await;
        }
        request.reply.set("Subtype", "Challenge");
        RCode::Handled
    }

    async fn reauthentication_request(&self, request: &mut Request) -> RCode {
        let rcode = self.run(request, self.sections.send_reauthentication_request).await;
        if !rcode.is_success() {
            return self.challenge_request(request).await;
        }
        request.reply.set("Subtype", "Reauthentication");
        RCode::Handled
    }

    async fn challenge_response(&self, request: &mut Request, reauth: bool) -> RCode {
        let section = if reauth {
            self.sections.recv_reauthentication_response
        } else {
            self.sections.recv_challenge_response
        };
        let rcode = self.run(request, section).await;
        if !rcode.is_success() {
            return self.failure_notification(request).await;
        }

        let length = self.settings.ephemeral_id_length;
        request.reply.set("Next-Pseudonym", ephemeral_id('2', length, request));
        request.reply.set("Next-Reauth-Id", ephemeral_id('4', length, request));
        if !self.run(request, self.sections.store_pseudonym).await.is_success() {
            warn!(request = request.id, "Failed storing pseudonym");
            request.reply.remove("Next-Pseudonym");
        }
        if !self.run(request, self.sections.store_session).await.is_success() {
            warn!(request = request.id, "Failed storing session");
            request.reply.remove("Next-Reauth-Id");
        }

        if self.settings.protected_success {
            let rcode = self.run(request, self.sections.send_success_notification).await;
            if !rcode.is_success() {
                return self.eap_failure(request).await;
            }
            request.reply.set("Subtype", "Notification");
            request.reply.set("Notification", "Success");
            return RCode::Handled;
        }
        self.eap_success(request).await
    }

    async fn synchronization_failure(&self, request: &mut Request) -> RCode {
        let rcode = self.run(request, self.sections.recv_synchronization_failure).await;
        if rcode.is_success() {
            // Policy resynchronised the vectors; challenge again
            return self.challenge_request(request).await;
        }
        self.eap_failure(request).await
    }

    async fn notification_ack(&self, request: &mut Request) -> RCode {
        match request.request.get("Notification") {
            Some("Success") => {
                let rcode = self.run(request, self.sections.recv_success_notification_ack).await;
                if rcode.is_success() {
                    self.eap_success(request).await
                } else {
                    self.eap_failure(request).await
                }
            }
            _ => {
                self.run(request, self.sections.recv_failure_notification_ack).await;
                self.eap_failure(request).await
            }
        }
    }

    async fn failure_notification(&self, request: &mut Request) -> RCode {
        let rcode = self.run(request, self.sections.send_failure_notification).await;
        if !rcode.is_success() {
            return self.eap_failure(request).await;
        }
        request.reply.set("Subtype", "Notification");
        request.reply.set("Notification", "Failure");
        RCode::Handled
    }

    async fn eap_success(&self, request: &mut Request) -> RCode {
        let rcode = self.run(request, self.sections.send_eap_success).await;
        if !rcode.is_success() {
            return self.eap_failure(request).await;
        }
        request.reply.remove("Subtype");
        request.reply.set("EAP-Code", "Success");
        RCode::Ok
    }

    async fn eap_failure(&self, request: &mut Request) -> RCode {
        self.run(request, self.sections.send_eap_failure).await;
        self.run(request, self.sections.clear_session).await;
        self.run(request, self.sections.clear_pseudonym).await;
        request.reply.remove("Subtype");
        request.reply.remove("Next-Pseudonym");
        request.reply.remove("Next-Reauth-Id");
        request.reply.set("EAP-Code", "Failure");
        RCode::Reject
    }
}

/// Fresh pseudonym or re-authentication identity
fn ephemeral_id(hint: char, length: usize, request: &Request) -> String {
    let mut out = String::with_capacity(length);
    out.push(hint);
    while out.len() < length {
        let mut hasher = DefaultHasher::new();
        ID_SEQUENCE.fetch_add(1, Ordering::Relaxed).hash(&mut hasher);
        request.id.hash(&mut hasher);
        request.request.get("Identity").hash(&mut hasher);
        out.push_str(&format!("{:016x}", hasher.finish()));
    }
    out.truncate(length);
    out
}

#[async_trait]
impl ProtocolInstance for AkaInstance {
    fn instantiate(&mut self, registry: &SectionRegistry) -> Result<(), ProtocolError> {
        if self.settings.request_identity == IdentityRequest::Init {
            info!("request_identity = init is not allowed for EAP-AKA, using none");
            self.settings.request_identity = IdentityRequest::None;
        }
        self.sections = Some(AkaSections::resolve(registry)?);
        Ok(())
    }

    async fn process(
        &self,
        dispatcher: &Dispatcher<'_>,
        server: &VirtualServer,
        request: &mut Request,
    ) -> Result<RCode, DispatchError> {
        let sections = self.sections.ok_or_else(|| DispatchError::Protocol {
            server: server.name().to_string(),
            reason: "EAP-AKA instance not instantiated".to_string(),
        })?;
        let step = Step {
            dispatcher,
            server,
            sections,
            settings: &self.settings,
        };

        let subtype = request.request.get("Subtype").map(str::to_string);
        let rcode = match subtype.as_deref() {
            None if request.request.contains("Identity") => step.identity_response(request).await,
            None => step.start(request).await,
            Some("Identity") => step.identity_response(request).await,
            Some("AKA-Identity") => step.aka_identity_response(request).await,
            Some("Challenge") => step.challenge_response(request, false).await,
            Some("Reauthentication") => step.challenge_response(request, true).await,
            Some("Client-Error") => {
                step.run(request, sections.recv_client_error).await;
                step.eap_failure(request).await
            }
            Some("Authentication-Reject") => {
                step.run(request, sections.recv_authentication_reject).await;
                step.eap_failure(request).await
            }
            Some("Synchronization-Failure") => step.synchronization_failure(request).await,
            Some("Notification") => step.notification_ack(request).await,
            Some(other) => {
                return Err(DispatchError::Protocol {
                    server: server.name().to_string(),
                    reason: format!("unknown EAP-AKA subtype {}", other),
                })
            }
        };

        debug!(request = request.id, server = %server.name(), rcode = %rcode, "EAP-AKA step complete");
        Ok(rcode)
    }

    fn settings(&self) -> serde_json::Value {
        serde_json::to_value(&self.settings).unwrap_or(serde_json::Value::Null)
    }
}
