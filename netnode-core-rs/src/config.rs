//! Dispatch configuration

use std::time::Duration;

use crate::types::{Direction, NodeId};

/// Directions in which this node acts as an intermediary.
///
/// Requests arriving in an intermediary direction are shown to the
/// forwarding decision engine before any handler runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct IntermediaryRoles {
    pub device_to_system: bool,
    pub system_to_device: bool,
}

impl IntermediaryRoles {
    pub const NONE: Self = Self {
        device_to_system: false,
        system_to_device: false,
    };

    pub const BOTH: Self = Self {
        device_to_system: true,
        system_to_device: true,
    };

    pub fn only(direction: Direction) -> Self {
        match direction {
            Direction::DeviceToSystem => Self {
                device_to_system: true,
                system_to_device: false,
            },
            Direction::SystemToDevice => Self {
                device_to_system: false,
                system_to_device: true,
            },
        }
    }

    pub fn applies_to(&self, direction: Direction) -> bool {
        match direction {
            Direction::DeviceToSystem => self.device_to_system,
            Direction::SystemToDevice => self.system_to_device,
        }
    }
}

/// Settings for one `Dispatcher`
#[derive(Debug, Clone)]
pub struct DispatchConfig {
    /// Identity of this node, appended to network paths when relaying
    pub node_id: NodeId,

    /// Where forwarding decisions are consulted
    pub intermediary: IntermediaryRoles,

    /// Upper bound for a single forwarding decision
    pub decide_timeout: Duration,

    /// Upper bound for handler invocation (None = unbounded)
    pub handler_timeout: Option<Duration>,

    /// Upper bound for a single event subscriber call
    pub subscriber_timeout: Duration,

    /// Panic on exchange defects (double completion) instead of logging
    pub strict_defects: bool,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            node_id: "networking-node".to_string(),
            intermediary: IntermediaryRoles::BOTH,
            decide_timeout: Duration::from_secs(5),
            handler_timeout: Some(Duration::from_secs(30)),
            subscriber_timeout: Duration::from_secs(5),
            strict_defects: cfg!(debug_assertions),
        }
    }
}

impl DispatchConfig {
    pub fn new(node_id: impl Into<NodeId>) -> Self {
        Self {
            node_id: node_id.into(),
            ..Default::default()
        }
    }

    pub fn with_intermediary(mut self, roles: IntermediaryRoles) -> Self {
        self.intermediary = roles;
        self
    }

    pub fn with_decide_timeout(mut self, timeout: Duration) -> Self {
        self.decide_timeout = timeout;
        self
    }

    pub fn with_handler_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.handler_timeout = timeout;
        self
    }

    pub fn with_subscriber_timeout(mut self, timeout: Duration) -> Self {
        self.subscriber_timeout = timeout;
        self
    }

    pub fn with_strict_defects(mut self, strict: bool) -> Self {
        self.strict_defects = strict;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_builder() {
        let config = DispatchConfig::new("nn-1")
            .with_intermediary(IntermediaryRoles::only(Direction::SystemToDevice))
            .with_decide_timeout(Duration::from_millis(250))
            .with_handler_timeout(None)
            .with_subscriber_timeout(Duration::from_millis(100))
            .with_strict_defects(false);

        assert_eq!(config.node_id, "nn-1");
        assert!(config.intermediary.applies_to(Direction::SystemToDevice));
        assert!(!config.intermediary.applies_to(Direction::DeviceToSystem));
        assert_eq!(config.decide_timeout, Duration::from_millis(250));
        assert_eq!(config.handler_timeout, None);
        assert_eq!(config.subscriber_timeout, Duration::from_millis(100));
        assert!(!config.strict_defects);
    }

    #[test]
    fn test_defaults() {
        let config = DispatchConfig::default();
        assert_eq!(config.decide_timeout, Duration::from_secs(5));
        assert_eq!(config.handler_timeout, Some(Duration::from_secs(30)));
        assert_eq!(config.subscriber_timeout, Duration::from_secs(5));
        assert_eq!(config.intermediary, IntermediaryRoles::BOTH);
        assert!(!IntermediaryRoles::NONE.applies_to(Direction::DeviceToSystem));
    }
}
