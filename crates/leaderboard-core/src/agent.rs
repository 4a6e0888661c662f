//! Agent boundary: lifecycle of the driving agent under evaluation.

use std::collections::HashSet;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::catalog::RouteDescriptor;
use crate::config::Track;
use crate::error::AgentError;
use crate::simulator::{Observation, VehicleControl};

/// Sensor types only the MAP track may request.
pub const MAP_ONLY_SENSORS: [&str; 2] = ["sensor.opendrive_map", "sensor.other.hd_map"];

/// One sensor requested by the agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SensorSpec {
    #[serde(rename = "type")]
    pub sensor_type: String,
    pub id: String,
}

impl SensorSpec {
    pub fn new(sensor_type: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            sensor_type: sensor_type.into(),
            id: id.into(),
        }
    }
}

/// What the agent declares about itself during setup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentProfile {
    pub track: Track,
    #[serde(default)]
    pub sensors: Vec<SensorSpec>,
}

impl AgentProfile {
    pub fn sensor_types(&self) -> Vec<String> {
        self.sensors.iter().map(|s| s.sensor_type.clone()).collect()
    }
}

/// A running agent instance. One instance drives exactly one episode.
#[async_trait]
pub trait DrivingAgent: Send {
    /// Set the agent up for `route` and collect its declared track and sensors.
    async fn configure(&mut self, route: &RouteDescriptor) -> Result<AgentProfile, AgentError>;

    /// Produce the control for one tick.
    async fn act(&mut self, observation: &Observation) -> Result<VehicleControl, AgentError>;

    /// Release everything the agent holds.
    async fn destroy(&mut self) -> Result<(), AgentError>;
}

/// Creates agent instances from an agent reference.
#[async_trait]
pub trait AgentLauncher: Send + Sync {
    /// Short description for logs.
    fn describe(&self) -> String;

    async fn launch(&self) -> Result<Box<dyn DrivingAgent>, AgentError>;
}

/// Check the agent's declared setup against the requested track.
pub fn validate_sensor_configuration(profile: &AgentProfile, track: Track) -> Result<(), String> {
    if profile.track != track {
        return Err(format!(
            "agent declares track {} but the evaluation runs {}",
            profile.track, track
        ));
    }

    let mut ids = HashSet::new();
    for sensor in &profile.sensors {
        if !ids.insert(sensor.id.as_str()) {
            return Err(format!("duplicate sensor id {:?}", sensor.id));
        }
        if track == Track::Sensors && MAP_ONLY_SENSORS.contains(&sensor.sensor_type.as_str()) {
            return Err(format!(
                "sensor {} ({}) is not allowed on the {} track",
                sensor.id, sensor.sensor_type, track
            ));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn profile(track: Track, sensors: &[(&str, &str)]) -> AgentProfile {
        AgentProfile {
            track,
            sensors: sensors
                .iter()
                .map(|(ty, id)| SensorSpec::new(*ty, *id))
                .collect(),
        }
    }

    #[test]
    fn test_sensors_track_accepts_cameras() {
        let p = profile(
            Track::Sensors,
            &[("sensor.camera.rgb", "Center"), ("sensor.other.gnss", "GPS")],
        );
        assert!(validate_sensor_configuration(&p, Track::Sensors).is_ok());
        assert_eq!(p.sensor_types()[1], "sensor.other.gnss");
    }

    #[test]
    fn test_hd_map_rejected_on_sensors_track() {
        let p = profile(Track::Sensors, &[("sensor.opendrive_map", "OpenDRIVE")]);
        let err = validate_sensor_configuration(&p, Track::Sensors).unwrap_err();
        assert!(err.contains("not allowed"));

        let p = profile(Track::Map, &[("sensor.other.hd_map", "HD")]);
        assert!(validate_sensor_configuration(&p, Track::Map).is_ok());
    }

    #[test]
    fn test_track_mismatch_rejected() {
        let p = profile(Track::Map, &[]);
        let err = validate_sensor_configuration(&p, Track::Sensors).unwrap_err();
        assert!(err.contains("MAP"));
    }

    #[test]
    fn test_duplicate_sensor_ids_rejected() {
        let p = profile(
            Track::Sensors,
            &[("sensor.camera.rgb", "Left"), ("sensor.lidar.ray_cast", "Left")],
        );
        assert!(validate_sensor_configuration(&p, Track::Sensors).is_err());
    }

    #[test]
    fn test_profile_wire_format() {
        let p: AgentProfile = serde_json::from_str(
            r#"{"track": "SENSORS", "sensors": [{"type": "sensor.camera.rgb", "id": "Center"}]}"#,
        )
        .unwrap();
        assert_eq!(p.sensors[0], SensorSpec::new("sensor.camera.rgb", "Center"));
    }
}
