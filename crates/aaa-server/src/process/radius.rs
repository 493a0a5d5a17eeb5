//! RADIUS process module
//!
//! Access-Request handling: `recv Access-Request` picks an `Auth-Type`,
//! the matching `authenticate <Auth-Type>` section checks the credentials,
//! and one of the `send` sections runs before the reply goes out. The reply
//! packet type is written to `&reply.Packet-Type`.

use crate::dispatch::Dispatcher;
use crate::error::DispatchError;
use crate::lifecycle::VirtualServer;
use crate::protocol::{parse_settings, section_id, ProtocolError, ProtocolInstance, ProtocolModule};
use crate::request::Request;
use crate::section::{MethodName, SectionId, SectionRef, SectionRegistry, SectionSpec, IDENT_ANY};
use aaa_proto::{DataType, DictError, Dictionary, ModActions, RCode};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

pub const NAMESPACE: &str = "radius";

static PROTOCOL_METHODS: [MethodName; 1] = [MethodName::new("group", IDENT_ANY)];
static AUTHENTICATE_METHODS: [MethodName; 1] = [MethodName::new("authenticate", IDENT_ANY)];

static SECTIONS: [SectionSpec; 6] = [
    SectionSpec::new("recv", "Access-Request", ModActions::authorize()),
    SectionSpec::new("authenticate", IDENT_ANY, ModActions::authenticate())
        .with_methods(&AUTHENTICATE_METHODS),
    SectionSpec::new("send", "Access-Accept", ModActions::post_auth()),
    SectionSpec::new("send", "Access-Reject", ModActions::post_auth()),
    SectionSpec::new("send", "Access-Challenge", ModActions::post_auth()),
    // Dynamic client checks are validated at startup and run elsewhere
    SectionSpec::uncached("new", "client"),
];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RadiusSettings {
    /// Reject requests with no `Auth-Type` instead of failing them
    #[serde(default = "default_reject_unknown")]
    pub reject_without_auth_type: bool,
    /// Reply-Message added to Access-Reject replies
    #[serde(default)]
    pub reject_message: Option<String>,
}

fn default_reject_unknown() -> bool {
    true
}

impl Default for RadiusSettings {
    fn default() -> Self {
        RadiusSettings {
            reject_without_auth_type: default_reject_unknown(),
            reject_message: None,
        }
    }
}

pub struct Radius;

impl ProtocolModule for Radius {
    fn name(&self) -> &'static str {
        "radius"
    }

    fn dict(&self) -> Result<Dictionary, DictError> {
        Dictionary::new(NAMESPACE)
            .with_attr("User-Name", 1, DataType::String)?
            .with_attr("User-Password", 2, DataType::String)?
            .with_attr("CHAP-Password", 3, DataType::Octets)?
            .with_attr("NAS-IP-Address", 4, DataType::IpAddr)?
            .with_attr("NAS-Port", 5, DataType::Integer)?
            .with_attr("Service-Type", 6, DataType::Integer)?
            .with_attr("Reply-Message", 18, DataType::String)?
            .with_attr("State", 24, DataType::Octets)?
            .with_attr("Class", 25, DataType::Octets)?
            .with_attr("Session-Timeout", 27, DataType::Integer)?
            .with_attr("Calling-Station-Id", 31, DataType::String)?
            .with_attr("NAS-Identifier", 32, DataType::String)
    }

    fn sections(&self) -> &'static [SectionSpec] {
        &SECTIONS
    }

    fn methods(&self) -> &'static [MethodName] {
        &PROTOCOL_METHODS
    }

    fn bootstrap(
        &self,
        server: &str,
        settings: &serde_json::Value,
    ) -> Result<Box<dyn ProtocolInstance>, ProtocolError> {
        let settings: RadiusSettings = parse_settings(self.name(), settings)?;
        debug!(server = %server, ?settings, "Bootstrapped RADIUS");
        Ok(Box::new(RadiusInstance {
            settings,
            sections: None,
        }))
    }
}

#[derive(Debug, Clone, Copy)]
struct RadiusSections {
    recv_access_request: SectionId,
    authenticate: SectionId,
    send_access_accept: SectionId,
    send_access_reject: SectionId,
    send_access_challenge: SectionId,
}

pub struct RadiusInstance {
    settings: RadiusSettings,
    sections: Option<RadiusSections>,
}

impl RadiusInstance {
    async fn reply(
        &self,
        dispatcher: &Dispatcher<'_>,
        server: &VirtualServer,
        request: &mut Request,
        sections: RadiusSections,
        result: RCode,
    ) -> RCode {
        let (section, packet) = match result {
            RCode::Ok | RCode::Updated => (sections.send_access_accept, "Access-Accept"),
            RCode::Handled => (sections.send_access_challenge, "Access-Challenge"),
            _ => (sections.send_access_reject, "Access-Reject"),
        };

        let rcode = dispatcher.call(request, server, &SectionRef::fixed(section)).await;
        if packet != "Access-Reject" && !rcode.is_success() {
            debug!(request = request.id, rcode = %rcode, "{} policy failed, rejecting", packet);
            return self.reject(dispatcher, server, request, sections).await;
        }

        request.reply.set("Packet-Type", packet);
        match packet {
            "Access-Accept" => RCode::Ok,
            "Access-Challenge" => RCode::Handled,
            _ => {
                self.add_reject_message(request);
                RCode::Reject
            }
        }
    }

    async fn reject(
        &self,
        dispatcher: &Dispatcher<'_>,
        server: &VirtualServer,
        request: &mut Request,
        sections: RadiusSections,
    ) -> RCode {
        dispatcher
            .call(request, server, &SectionRef::fixed(sections.send_access_reject))
            .await;
        request.reply.set("Packet-Type", "Access-Reject");
        self.add_reject_message(request);
        RCode::Reject
    }

    fn add_reject_message(&self, request: &mut Request) {
        if let Some(message) = &self.settings.reject_message {
            if !request.reply.contains("Reply-Message") {
                request.reply.add("Reply-Message", message.clone());
            }
        }
    }
}

#[async_trait]
impl ProtocolInstance for RadiusInstance {
    fn instantiate(&mut self, registry: &SectionRegistry) -> Result<(), ProtocolError> {
        self.sections = Some(RadiusSections {
            recv_access_request: section_id(registry, "recv", "Access-Request")?,
            authenticate: section_id(registry, "authenticate", IDENT_ANY)?,
            send_access_accept: section_id(registry, "send", "Access-Accept")?,
            send_access_reject: section_id(registry, "send", "Access-Reject")?,
            send_access_challenge: section_id(registry, "send", "Access-Challenge")?,
        });
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
            reason: "RADIUS instance not instantiated".to_string(),
        })?;

        let rcode = dispatcher
            .call(request, server, &SectionRef::fixed(sections.recv_access_request))
            .await;
        match rcode {
            RCode::Handled => return Ok(RCode::Handled),
            rcode if !rcode.is_success() => {
                return Ok(self.reject(dispatcher, server, request, sections).await);
            }
            _ => {}
        }

        let auth_type = request.control.get("Auth-Type").map(str::to_string);
        let result = match auth_type.as_deref() {
            Some("Accept") => RCode::Ok,
            Some("Reject") => RCode::Reject,
            Some(auth_type) => {
                let entry = SectionRef::named(sections.authenticate, auth_type);
                if server.compiled_section(&entry).is_none() {
                    warn!(
                        request = request.id,
                        server = %server.name(),
                        "No 'authenticate {}' section configured",
                        auth_type
                    );
                    request.fail(format!("no 'authenticate {}' section", auth_type))
                } else {
                    dispatcher.call(request, server, &entry).await
                }
            }
            None if self.settings.reject_without_auth_type => {
                debug!(request = request.id, "No Auth-Type found, rejecting");
                RCode::Reject
            }
            None => {
                return Err(DispatchError::Protocol {
                    server: server.name().to_string(),
                    reason: "no Auth-Type set by recv Access-Request".to_string(),
                })
            }
        };

        Ok(self.reply(dispatcher, server, request, sections, result).await)
    }

    fn settings(&self) -> serde_json::Value {
        serde_json::to_value(&self.settings).unwrap_or(serde_json::Value::Null)
    }
}
