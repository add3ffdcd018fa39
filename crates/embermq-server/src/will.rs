//! Will message handling.
//!
//! A will is captured at CONNECT and kept on the session until it is
//! either discarded (graceful DISCONNECT, takeover rules) or activated
//! (abnormal close, DISCONNECT-with-will). Activation publishes it
//! through the normal publish path, immediately or after the v5 will
//! delay interval; the pending will rides on its session so a takeover
//! cancels it and session expiry fires it at the latest.

use bytes::Bytes;

use embermq_core::error::Result;
use embermq_core::packet::{PublishProperties, QoS, Will};
use embermq_core::topic;

/// A will held by a session, ready to publish on activation.
#[derive(Debug, Clone)]
pub struct PendingWill {
    pub topic: String,
    pub payload: Bytes,
    pub qos: QoS,
    pub retain: bool,
    /// Seconds to wait after abnormal close before publishing (v5).
    pub delay_interval: u32,
    pub message_expiry_interval: Option<u32>,
    pub properties: Option<PublishProperties>,
}

impl PendingWill {
    /// Build from the CONNECT will block, applying the listener mount
    /// point and validating the resulting topic.
    pub fn from_connect(will: Will, mount_point: Option<&str>) -> Result<Self> {
        let topic = match mount_point {
            Some(prefix) => format!("{}{}", prefix, will.topic),
            None => will.topic,
        };
        topic::valid_publish_topic(&topic)?;

        let (delay_interval, message_expiry_interval, properties) = match will.properties {
            Some(props) => {
                let publish_props = PublishProperties {
                    payload_format_indicator: props.payload_format_indicator,
                    content_type: props.content_type,
                    response_topic: props.response_topic,
                    correlation_data: props.correlation_data,
                    user_properties: props.user_properties,
                    ..Default::default()
                };
                let publish_props = if publish_props.is_empty() {
                    None
                } else {
                    Some(publish_props)
                };
                (
                    props.will_delay_interval.unwrap_or(0),
                    props.message_expiry_interval,
                    publish_props,
                )
            }
            None => (0, None, None),
        };

        Ok(Self {
            topic,
            payload: will.payload,
            qos: will.qos,
            retain: will.retain,
            delay_interval,
            message_expiry_interval,
            properties,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use embermq_core::packet::WillProperties;

    fn connect_will(topic: &str, props: Option<WillProperties>) -> Will {
        Will {
            topic: topic.into(),
            payload: Bytes::from_static(b"offline"),
            qos: QoS::AtLeastOnce,
            retain: true,
            properties: props,
        }
    }

    #[test]
    fn test_from_connect_plain() {
        let will = PendingWill::from_connect(connect_will("status/a", None), None).unwrap();
        assert_eq!(will.topic, "status/a");
        assert_eq!(will.delay_interval, 0);
        assert!(will.retain);
        assert!(will.properties.is_none());
    }

    #[test]
    fn test_from_connect_with_mount_point() {
        let will =
            PendingWill::from_connect(connect_will("status/a", None), Some("tenant1/")).unwrap();
        assert_eq!(will.topic, "tenant1/status/a");
    }

    #[test]
    fn test_from_connect_with_delay() {
        let props = WillProperties {
            will_delay_interval: Some(30),
            message_expiry_interval: Some(120),
            content_type: Some("text/plain".into()),
            ..Default::default()
        };
        let will = PendingWill::from_connect(connect_will("w", Some(props)), None).unwrap();
        assert_eq!(will.delay_interval, 30);
        assert_eq!(will.message_expiry_interval, Some(120));
        assert_eq!(
            will.properties.unwrap().content_type.as_deref(),
            Some("text/plain")
        );
    }

    #[test]
    fn test_wildcard_will_topic_rejected() {
        assert!(PendingWill::from_connect(connect_will("a/+", None), None).is_err());
    }
}
