//! Plugin-to-plugin messaging
//!
//! Messages are delivered by executing the target plugin through the
//! registry, so delivery goes through the same enablement and permission
//! checks and lands in the execution ledger like any other call.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::manifest::Permission;
use crate::payload::Payload;
use crate::registry::PluginRegistry;
use crate::{PluginError, Result};

/// Type tag of the input a target plugin receives
pub const DELIVERY_MESSAGE_TYPE: &str = "plugin_message";

/// Type tag of replies whose output does not name one
pub const DEFAULT_REPLY_TYPE: &str = "plugin_response";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PluginMessage {
    pub id: Uuid,
    pub message_type: String,
    pub payload: Payload,
    pub sender_id: Uuid,
    pub timestamp: DateTime<Utc>,
}

impl PluginMessage {
    pub fn new(message_type: impl Into<String>, payload: Payload, sender_id: Uuid) -> Self {
        Self {
            id: Uuid::new_v4(),
            message_type: message_type.into(),
            payload,
            sender_id,
            timestamp: Utc::now(),
        }
    }

    /// Input handed to the target plugin
    fn delivery_input(&self) -> Payload {
        Payload::map([
            ("messageType", Payload::from(DELIVERY_MESSAGE_TYPE)),
            ("payload", self.payload.clone()),
        ])
    }
}

#[derive(Clone)]
pub struct MessageMediator {
    registry: PluginRegistry,
}

impl MessageMediator {
    pub fn new(registry: PluginRegistry) -> Self {
        Self { registry }
    }

    /// Deliver `message` from one plugin to another and return the reply.
    pub async fn send_message(
        &self,
        from: Uuid,
        to: Uuid,
        message: PluginMessage,
    ) -> Result<PluginMessage> {
        let sender = self
            .registry
            .get(from)
            .await
            .ok_or(PluginError::NotFound(from))?;
        let target = self
            .registry
            .get(to)
            .await
            .ok_or(PluginError::NotFound(to))?;

        if !sender.has_permission(Permission::InterPluginCommunication) {
            return Err(PluginError::PermissionsDenied {
                plugin: sender.manifest.name,
                denied: vec![Permission::InterPluginCommunication],
            });
        }

        if !target.manifest.accepts_messages {
            return Err(PluginError::MessageNotAccepted(to));
        }

        debug!(
            from = %from,
            to = %to,
            message_type = %message.message_type,
            "Delivering plugin message"
        );

        let delivery_failed = |reason: String| {
            warn!(from = %from, to = %to, reason = %reason, "Plugin message delivery failed");
            PluginError::MessageDeliveryFailed { target: to, reason }
        };

        let result = match self.registry.execute(to, message.delivery_input()).await {
            Ok(result) => result,
            Err(PluginError::NotFound(id)) => return Err(PluginError::NotFound(id)),
            Err(e) => return Err(delivery_failed(e.to_string())),
        };

        if !result.success {
            return Err(delivery_failed(
                result
                    .error
                    .unwrap_or_else(|| "plugin reported failure".to_string()),
            ));
        }

        match result.output {
            Some(output) if output.is_map() => {
                let message_type = output
                    .get("messageType")
                    .and_then(Payload::as_str)
                    .unwrap_or(DEFAULT_REPLY_TYPE)
                    .to_string();
                Ok(PluginMessage::new(message_type, output, to))
            }
            Some(_) => Err(delivery_failed("reply output is not a map".to_string())),
            None => Err(delivery_failed("plugin produced no output".to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builtin::BuiltinRunner;
    use crate::manifest::{PluginManifest, PluginType};
    use std::sync::Arc;

    fn manifest(name: &str, permissions: &[Permission], accepts_messages: bool) -> PluginManifest {
        PluginManifest {
            name: name.to_string(),
            version: "0.1.0".to_string(),
            description: String::new(),
            author: "Tessera".to_string(),
            permissions: permissions.iter().copied().collect(),
            entry_point: "builtin:echo".to_string(),
            plugin_type: PluginType::Workflow,
            auto_enable: true,
            accepts_messages,
        }
    }

    fn mediator() -> (PluginRegistry, MessageMediator) {
        let runner = BuiltinRunner::with_defaults()
            .with_handler("typed", |_, _| {
                Ok(Payload::map([("messageType", Payload::from("pong"))]))
            })
            .with_handler("scalar", |_, _| Ok(Payload::from(42.0)));
        let registry = PluginRegistry::new(Arc::new(runner));
        (registry.clone(), MessageMediator::new(registry))
    }

    #[tokio::test]
    async fn test_reply_defaults_to_plugin_response() {
        let (registry, mediator) = mediator();
        let a = registry
            .install(manifest("a", &[Permission::InterPluginCommunication], false))
            .await
            .expect("install a");
        let b = registry.install(manifest("b", &[], true)).await.expect("install b");

        let message = PluginMessage::new("greeting", Payload::from("hi"), a.id);
        let reply = mediator.send_message(a.id, b.id, message).await.expect("reply");

        assert_eq!(reply.sender_id, b.id);
        assert_eq!(reply.message_type, DEFAULT_REPLY_TYPE);
        let delivered = reply.payload.get("echo").expect("echoed input");
        assert_eq!(
            delivered.get("messageType").and_then(Payload::as_str),
            Some(DELIVERY_MESSAGE_TYPE)
        );
        assert_eq!(delivered.get("payload"), Some(&Payload::from("hi")));

        let Payload::Map(keys) = delivered else {
            panic!("delivered input is not a map");
        };
        assert_eq!(
            keys.keys().map(String::as_str).collect::<Vec<_>>(),
            vec!["messageType", "payload"]
        );
    }

    #[tokio::test]
    async fn test_reply_type_taken_from_output() {
        let (registry, mediator) = mediator();
        let a = registry
            .install(manifest("a", &[Permission::InterPluginCommunication], false))
            .await
            .expect("install a");
        let mut m = manifest("b", &[], true);
        m.entry_point = "builtin:typed".to_string();
        let b = registry.install(m).await.expect("install b");

        let reply = mediator
            .send_message(a.id, b.id, PluginMessage::new("ping", Payload::empty(), a.id))
            .await
            .expect("reply");
        assert_eq!(reply.message_type, "pong");
    }

    #[tokio::test]
    async fn test_non_map_output_fails_delivery() {
        let (registry, mediator) = mediator();
        let a = registry
            .install(manifest("a", &[Permission::InterPluginCommunication], false))
            .await
            .expect("install a");
        let mut m = manifest("b", &[], true);
        m.entry_point = "builtin:scalar".to_string();
        let b = registry.install(m).await.expect("install b");

        let err = mediator
            .send_message(a.id, b.id, PluginMessage::new("ping", Payload::empty(), a.id))
            .await
            .unwrap_err();
        assert!(matches!(err, PluginError::MessageDeliveryFailed { target, .. } if target == b.id));
    }

    #[tokio::test]
    async fn test_disabled_target_fails_delivery() {
        let (registry, mediator) = mediator();
        let a = registry
            .install(manifest("a", &[Permission::InterPluginCommunication], false))
            .await
            .expect("install a");
        let b = registry.install(manifest("b", &[], true)).await.expect("install b");
        registry.disable(b.id).await.expect("disable");

        let err = mediator
            .send_message(a.id, b.id, PluginMessage::new("ping", Payload::empty(), a.id))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "E521");
        assert!(err.to_string().contains("disabled"));
    }

    #[tokio::test]
    async fn test_unknown_endpoints() {
        let (registry, mediator) = mediator();
        let a = registry
            .install(manifest("a", &[Permission::InterPluginCommunication], false))
            .await
            .expect("install a");
        let ghost = Uuid::new_v4();

        let err = mediator
            .send_message(a.id, ghost, PluginMessage::new("ping", Payload::empty(), a.id))
            .await
            .unwrap_err();
        assert!(matches!(err, PluginError::NotFound(id) if id == ghost));

        let err = mediator
            .send_message(ghost, a.id, PluginMessage::new("ping", Payload::empty(), ghost))
            .await
            .unwrap_err();
        assert!(matches!(err, PluginError::NotFound(id) if id == ghost));
    }
}
