use serde::{Deserialize, Serialize};

/// Which way MIDI flows through a device, from the owning node's point
/// of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Input,
    Output,
}

/// A single MIDI endpoint as advertised between nodes.
///
/// Device ids are only unique within the owning node; the composite
/// `(NodeId, device_id)` key is what identifies a device mesh-wide.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceDescriptor {
    pub device_id: u16,
    pub name: String,
    pub direction: Direction,
}

impl DeviceDescriptor {
    pub fn new(device_id: u16, name: impl Into<String>, direction: Direction) -> Self {
        Self {
            device_id,
            name: name.into(),
            direction,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_direction_serde_lowercase() {
        let json = serde_json::to_string(&Direction::Input).unwrap();
        assert_eq!(json, "\"input\"");
        let back: Direction = serde_json::from_str("\"output\"").unwrap();
        assert_eq!(back, Direction::Output);
    }
}
