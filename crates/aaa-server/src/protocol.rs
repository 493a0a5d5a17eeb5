//! Protocol module contract
//!
//! A protocol module owns a dictionary (its namespace), a table of processing
//! sections, and a state machine. The server core loads each protocol once,
//! registers its sections, then asks it for one [`ProtocolInstance`] per
//! virtual server bound to its namespace.

use crate::dispatch::Dispatcher;
use crate::error::DispatchError;
use crate::lifecycle::VirtualServer;
use crate::request::Request;
use crate::section::{MethodName, SectionId, SectionRegistry, SectionSpec};
use aaa_proto::{DictError, Dictionary, RCode};
use async_trait::async_trait;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("Invalid {protocol} settings: {reason}")]
    Settings { protocol: String, reason: String },
    #[error("Protocol {protocol} has no processing section '{section}'")]
    MissingSection { protocol: String, section: String },
    #[error("Failed to load protocol {protocol}: {reason}")]
    Load { protocol: String, reason: String },
    #[error("Dictionary error: {0}")]
    Dict(#[from] DictError),
}

/// A protocol implementation
pub trait ProtocolModule: Send + Sync {
    /// Module name, e.g. "eap_aka"
    fn name(&self) -> &'static str;

    /// Build the protocol dictionary; its name is the namespace
    fn dict(&self) -> Result<Dictionary, DictError>;

    /// Processing sections, in compile order
    fn sections(&self) -> &'static [SectionSpec];

    /// Module methods callable in every section of this protocol
    fn methods(&self) -> &'static [MethodName] {
        &[]
    }

    /// Global setup, run when the server context is built and again on
    /// the first load after an unload
    fn onload(&self) -> Result<(), ProtocolError> {
        Ok(())
    }

    /// Global teardown, run when the server shuts down, or when a context
    /// that was never shut down drops
    fn unload(&self) {}

    /// Parse one virtual server's settings
    fn bootstrap(
        &self,
        server: &str,
        settings: &serde_json::Value,
    ) -> Result<Box<dyn ProtocolInstance>, ProtocolError>;
}

/// Per virtual server state of a protocol
#[async_trait]
pub trait ProtocolInstance: Send + Sync {
    /// Resolve section handles and finish configuration
    fn instantiate(&mut self, registry: &SectionRegistry) -> Result<(), ProtocolError>;

    /// Entry point for a request arriving at the virtual server
    async fn process(
        &self,
        dispatcher: &Dispatcher<'_>,
        server: &VirtualServer,
        request: &mut Request,
    ) -> Result<RCode, DispatchError>;

    /// Effective settings, for debug output
    fn settings(&self) -> serde_json::Value {
        serde_json::Value::Null
    }
}

/// Look up a section handle a protocol needs
pub fn section_id(
    registry: &SectionRegistry,
    name1: &str,
    name2: &str,
) -> Result<SectionId, ProtocolError> {
    registry
        .lookup(name1, Some(name2))
        .map(|(id, _)| id)
        .ok_or_else(|| ProtocolError::MissingSection {
            protocol: registry.protocol().to_string(),
            section: format!("{} {}", name1, name2),
        })
}

/// Parse settings into a typed struct, treating null as all defaults
pub fn parse_settings<T>(protocol: &str, settings: &serde_json::Value) -> Result<T, ProtocolError>
where
    T: serde::de::DeserializeOwned + Default,
{
    if settings.is_null() {
        return Ok(T::default());
    }
    serde_json::from_value(settings.clone()).map_err(|e| ProtocolError::Settings {
        protocol: protocol.to_string(),
        reason: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use aaa_proto::ModActions;
    use serde::Deserialize;

    #[derive(Debug, Default, Deserialize, PartialEq)]
    struct Settings {
        #[serde(default)]
        verbose: bool,
    }

    #[test]
    fn test_section_id() {
        let registry = SectionRegistry::from_specs(
            "test",
            [SectionSpec::new("recv", "Request", ModActions::authorize())],
        )
        .unwrap();
        assert_eq!(section_id(&registry, "recv", "Request").unwrap().index(), 0);
        assert!(matches!(
            section_id(&registry, "send", "Reply"),
            Err(ProtocolError::MissingSection { ref section, .. }) if section == "send Reply"
        ));
    }

    #[test]
    fn test_parse_settings() {
        let parsed: Settings = parse_settings("test", &serde_json::Value::Null).unwrap();
        assert_eq!(parsed, Settings::default());

        let parsed: Settings = parse_settings("test", &serde_json::json!({ "verbose": true })).unwrap();
        assert!(parsed.verbose);

        let err = parse_settings::<Settings>("test", &serde_json::json!({ "verbose": "x" })).unwrap_err();
        assert!(matches!(err, ProtocolError::Settings { .. }));
    }
}
