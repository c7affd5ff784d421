//! In-memory home graph: devices, areas, scenes.
//!
//! State transitions return events as values; the tool layer publishes them
//! to the subscription hub and the audit log. Nothing here talks to the
//! policy engine — callers authorize before applying.

use std::collections::HashMap;
use std::sync::RwLock;

use meridian_protocol::{ToolError, ToolResult};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// Device categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceKind {
    Light,
    Switch,
    Thermostat,
    Lock,
}

/// One device and its current state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Device {
    pub id: String,
    pub name: String,
    pub kind: DeviceKind,
    pub area: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub on: bool,
    #[serde(default)]
    pub locked: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
}

/// A named set of device commands.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Scene {
    pub id: String,
    pub name: String,
    pub commands: Vec<SceneCommand>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SceneCommand {
    pub device_id: String,
    pub action: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<f64>,
}

/// A state-change event emitted by the graph.
#[derive(Debug, Clone)]
pub struct HomeChange {
    pub device_id: String,
    pub action: String,
    pub state: Value,
}

/// The graph. Locked for writes; reads snapshot.
pub struct HomeGraph {
    devices: RwLock<HashMap<String, Device>>,
    scenes: HashMap<String, Scene>,
}

impl HomeGraph {
    pub fn new(devices: Vec<Device>, scenes: Vec<Scene>) -> Self {
        Self {
            devices: RwLock::new(devices.into_iter().map(|d| (d.id.clone(), d)).collect()),
            scenes: scenes.into_iter().map(|s| (s.id.clone(), s)).collect(),
        }
    }

    /// Default layout used when no layout file is configured.
    pub fn with_default_layout() -> Self {
        let devices = vec![
            Device {
                id: "light_living".into(),
                name: "Living Room Light".into(),
                kind: DeviceKind::Light,
                area: "living_room".into(),
                tags: vec!["lighting".into()],
                on: false,
                locked: false,
                temperature: None,
            },
            Device {
                id: "light_bedroom".into(),
                name: "Bedroom Light".into(),
                kind: DeviceKind::Light,
                area: "bedroom".into(),
                tags: vec!["lighting".into()],
                on: false,
                locked: false,
                temperature: None,
            },
            Device {
                id: "hvac_main".into(),
                name: "Main Thermostat".into(),
                kind: DeviceKind::Thermostat,
                area: "hallway".into(),
                tags: vec!["climate".into()],
                on: true,
                locked: false,
                temperature: Some(70.0),
            },
            Device {
                id: "door_front".into(),
                name: "Front Door".into(),
                kind: DeviceKind::Lock,
                area: "entry".into(),
                tags: vec!["security".into()],
                on: false,
                locked: true,
                temperature: None,
            },
        ];
        let scenes = vec![Scene {
            id: "movie_night".into(),
            name: "Movie Night".into(),
            commands: vec![
                SceneCommand {
                    device_id: "light_living".into(),
                    action: "turn_off".into(),
                    value: None,
                },
                SceneCommand {
                    device_id: "light_bedroom".into(),
                    action: "turn_off".into(),
                    value: None,
                },
            ],
        }];
        Self::new(devices, scenes)
    }

    /// Load a layout file; fall back to the default layout when absent.
    pub fn from_layout_file(path: &std::path::Path) -> Self {
        #[derive(Deserialize)]
        struct Layout {
            #[serde(default)]
            devices: Vec<Device>,
            #[serde(default)]
            scenes: Vec<Scene>,
        }

        match std::fs::read_to_string(path)
            .ok()
            .and_then(|raw| serde_json::from_str::<Layout>(&raw).ok())
        {
            Some(layout) => Self::new(layout.devices, layout.scenes),
            None => Self::with_default_layout(),
        }
    }

    pub fn devices(&self) -> Vec<Device> {
        let mut devices: Vec<Device> = self
            .devices
            .read()
            .expect("home lock")
            .values()
            .cloned()
            .collect();
        devices.sort_by(|a, b| a.id.cmp(&b.id));
        devices
    }

    pub fn device(&self, id: &str) -> ToolResult<Device> {
        self.devices
            .read()
            .expect("home lock")
            .get(id)
            .cloned()
            .ok_or_else(|| ToolError::not_found(format!("no such device: {id}")))
    }

    pub fn areas(&self) -> Vec<String> {
        let mut areas: Vec<String> = self
            .devices
            .read()
            .expect("home lock")
            .values()
            .map(|d| d.area.clone())
            .collect();
        areas.sort();
        areas.dedup();
        areas
    }

    pub fn scenes(&self) -> Vec<Scene> {
        let mut scenes: Vec<Scene> = self.scenes.values().cloned().collect();
        scenes.sort_by(|a, b| a.id.cmp(&b.id));
        scenes
    }

    pub fn scene(&self, id: &str) -> ToolResult<Scene> {
        self.scenes
            .get(id)
            .cloned()
            .ok_or_else(|| ToolError::not_found(format!("no such scene: {id}")))
    }

    /// Apply one command, returning the resulting change event.
    pub fn apply(&self, device_id: &str, action: &str, value: Option<f64>) -> ToolResult<HomeChange> {
        let mut devices = self.devices.write().expect("home lock");
        let device = devices
            .get_mut(device_id)
            .ok_or_else(|| ToolError::not_found(format!("no such device: {device_id}")))?;

        match (action, device.kind) {
            ("turn_on", DeviceKind::Light | DeviceKind::Switch) => device.on = true,
            ("turn_off", DeviceKind::Light | DeviceKind::Switch) => device.on = false,
            ("toggle", DeviceKind::Light | DeviceKind::Switch) => device.on = !device.on,
            ("lock", DeviceKind::Lock) => device.locked = true,
            ("unlock", DeviceKind::Lock) => device.locked = false,
            ("set_temperature", DeviceKind::Thermostat) => {
                let target = value.ok_or_else(|| {
                    ToolError::invalid_argument("set_temperature requires a value")
                })?;
                device.temperature = Some(target);
            }
            _ => {
                return Err(ToolError::invalid_argument(format!(
                    "action {action} does not apply to {:?} device {device_id}",
                    device.kind
                )));
            }
        }

        Ok(HomeChange {
            device_id: device_id.to_string(),
            action: action.to_string(),
            state: json!({
                "on": device.on,
                "locked": device.locked,
                "temperature": device.temperature,
            }),
        })
    }

    /// Apply every command in a scene, stopping at the first failure.
    pub fn activate_scene(&self, scene_id: &str) -> ToolResult<Vec<HomeChange>> {
        let scene = self.scene(scene_id)?;
        let mut changes = Vec::with_capacity(scene.commands.len());
        for command in &scene.commands {
            changes.push(self.apply(&command.device_id, &command.action, command.value)?);
        }
        Ok(changes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use meridian_protocol::ErrorCode;

    #[test]
    fn test_default_layout_has_devices() {
        let graph = HomeGraph::with_default_layout();
        assert!(!graph.devices().is_empty());
        assert!(graph.device("door_front").is_ok());
        assert!(graph.areas().contains(&"entry".to_string()));
    }

    #[test]
    fn test_apply_light_commands() {
        let graph = HomeGraph::with_default_layout();

        let change = graph.apply("light_living", "turn_on", None).unwrap();
        assert_eq!(change.state["on"], true);
        assert!(graph.device("light_living").unwrap().on);

        let change = graph.apply("light_living", "toggle", None).unwrap();
        assert_eq!(change.state["on"], false);
    }

    #[test]
    fn test_apply_lock_and_thermostat() {
        let graph = HomeGraph::with_default_layout();

        let change = graph.apply("door_front", "unlock", None).unwrap();
        assert_eq!(change.state["locked"], false);

        let change = graph
            .apply("hvac_main", "set_temperature", Some(68.0))
            .unwrap();
        assert_eq!(change.state["temperature"], 68.0);
    }

    #[test]
    fn test_mismatched_action_rejected() {
        let graph = HomeGraph::with_default_layout();
        let err = graph.apply("light_living", "unlock", None).unwrap_err();
        assert_eq!(err.code, ErrorCode::InvalidArgument);

        let err = graph.apply("missing", "turn_on", None).unwrap_err();
        assert_eq!(err.code, ErrorCode::NotFound);
    }

    #[test]
    fn test_scene_activation() {
        let graph = HomeGraph::with_default_layout();
        graph.apply("light_living", "turn_on", None).unwrap();

        let changes = graph.activate_scene("movie_night").unwrap();
        assert_eq!(changes.len(), 2);
        assert!(!graph.device("light_living").unwrap().on);
        assert!(!graph.device("light_bedroom").unwrap().on);
    }
}
