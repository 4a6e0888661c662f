//! JSON scenario catalog parsing and trigger attachment.
//!
//! The catalog groups event configurations by town and scenario type:
//!
//! ```json
//! {"available_scenarios": [{"Town01": [{
//!     "scenario_type": "Scenario3",
//!     "available_event_configurations": [
//!         {"transform": {"x": "1.0", "y": "2.0", "z": "0.0", "yaw": "270"}, "other_actors": {}}
//!     ]
//! }]}]}
//! ```

use std::path::Path;

use serde_json::Value;

use super::{
    RouteDescriptor, ScenarioTrigger, ScenarioType, TriggerLocation, TRIGGER_ANGLE_DEG,
    TRIGGER_DISTANCE_M,
};
use crate::error::CatalogError;

/// A trigger together with the town it belongs to.
#[derive(Debug, Clone, PartialEq)]
pub struct TownTrigger {
    pub town: String,
    pub trigger: ScenarioTrigger,
}

/// Parse the scenario catalog into a flat list of triggers in catalog order.
pub fn parse_scenarios(json: &str, path: &Path) -> Result<Vec<TownTrigger>, CatalogError> {
    let malformed = |message: String| CatalogError::Json {
        path: path.to_path_buf(),
        message,
    };

    let root: Value = serde_json::from_str(json).map_err(|e| malformed(e.to_string()))?;
    let groups = root
        .get("available_scenarios")
        .and_then(Value::as_array)
        .ok_or_else(|| malformed("missing \"available_scenarios\" array".into()))?;

    let mut triggers = Vec::new();
    for group in groups {
        let towns = group
            .as_object()
            .ok_or_else(|| malformed("scenario group is not an object".into()))?;
        for (town, scenarios) in towns {
            let scenarios = scenarios
                .as_array()
                .ok_or_else(|| malformed(format!("{town}: scenarios are not an array")))?;
            for scenario in scenarios {
                let scenario_type: ScenarioType = scenario
                    .get("scenario_type")
                    .and_then(Value::as_str)
                    .ok_or_else(|| malformed(format!("{town}: entry without scenario_type")))?
                    .parse()?;
                let events = scenario
                    .get("available_event_configurations")
                    .and_then(Value::as_array)
                    .map(Vec::as_slice)
                    .unwrap_or_default();
                for event in events {
                    let trigger = parse_event(scenario_type, event)
                        .map_err(|e| malformed(format!("{town} {scenario_type}: {e}")))?;
                    triggers.push(TownTrigger {
                        town: town.clone(),
                        trigger,
                    });
                }
            }
        }
    }
    Ok(triggers)
}

fn parse_event(scenario_type: ScenarioType, event: &Value) -> Result<ScenarioTrigger, String> {
    let object = event.as_object().ok_or("event configuration is not an object")?;
    let transform = object
        .get("transform")
        .ok_or("event configuration has no transform")?;
    let location = TriggerLocation {
        x: coordinate(transform, "x", true)?,
        y: coordinate(transform, "y", true)?,
        z: coordinate(transform, "z", false)?,
        yaw: coordinate(transform, "yaw", false)?,
    };
    let parameters = object
        .iter()
        .filter(|(key, _)| key.as_str() != "transform")
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect();
    Ok(ScenarioTrigger {
        scenario_type,
        location,
        parameters,
    })
}

/// Catalog numbers appear both as JSON numbers and as numeric strings.
fn coordinate(transform: &Value, key: &str, required: bool) -> Result<f64, String> {
    match transform.get(key) {
        Some(Value::Number(n)) => n
            .as_f64()
            .ok_or_else(|| format!("transform.{key} is out of range")),
        Some(Value::String(s)) => s
            .trim()
            .parse::<f64>()
            .map_err(|_| format!("transform.{key}={s:?} is not a number")),
        Some(other) => Err(format!("transform.{key} has unexpected value {other}")),
        None if required => Err(format!("transform is missing {key}")),
        None => Ok(0.0),
    }
}

/// Attach every trigger that lies on `route`.
///
/// A trigger matches when it is in the route's town, within [`TRIGGER_DISTANCE_M`] of some
/// waypoint in the plane, and its heading is within [`TRIGGER_ANGLE_DEG`] of that waypoint's.
/// Each trigger is attached at most once; catalog order is kept.
pub fn attach_triggers(route: &mut RouteDescriptor, triggers: &[TownTrigger]) {
    for candidate in triggers.iter().filter(|t| t.town == route.town) {
        let location = &candidate.trigger.location;
        let on_route = route.waypoints.iter().any(|wp| {
            wp.planar_distance(location.x, location.y) <= TRIGGER_DISTANCE_M
                && yaw_difference(wp.yaw, location.yaw) <= TRIGGER_ANGLE_DEG
        });
        if on_route && !route.triggers.contains(&candidate.trigger) {
            route.triggers.push(candidate.trigger.clone());
        }
    }
}

/// Smallest absolute difference between two headings, in degrees.
fn yaw_difference(a: f64, b: f64) -> f64 {
    let diff = (a - b).rem_euclid(360.0);
    diff.min(360.0 - diff)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::Waypoint;

    fn route(town: &str, waypoints: &[(f64, f64, f64)]) -> RouteDescriptor {
        RouteDescriptor {
            id: "0".into(),
            town: town.into(),
            waypoints: waypoints
                .iter()
                .map(|&(x, y, yaw)| Waypoint {
                    x,
                    y,
                    yaw,
                    ..Waypoint::default()
                })
                .collect(),
            weather: None,
            triggers: vec![],
        }
    }

    fn trigger(town: &str, ty: ScenarioType, x: f64, y: f64, yaw: f64) -> TownTrigger {
        TownTrigger {
            town: town.into(),
            trigger: ScenarioTrigger {
                scenario_type: ty,
                location: TriggerLocation { x, y, z: 0.0, yaw },
                parameters: serde_json::Map::new(),
            },
        }
    }

    #[test]
    fn test_parse_numbers_and_strings() {
        let json = r#"{"available_scenarios": [
            {"Town01": [
                {"scenario_type": "Scenario1",
                 "available_event_configurations": [
                    {"transform": {"x": 1.5, "y": "-2.0", "z": "0.3", "yaw": 180}},
                    {"transform": {"x": "4", "y": "5"}, "other_actors": {"left": []}}
                 ]}
            ]},
            {"Town02": [
                {"scenario_type": "Scenario10", "available_event_configurations": []}
            ]}
        ]}"#;
        let triggers = parse_scenarios(json, Path::new("s.json")).unwrap();
        assert_eq!(triggers.len(), 2);
        assert_eq!(triggers[0].town, "Town01");
        assert_eq!(triggers[0].trigger.location.y, -2.0);
        assert_eq!(triggers[0].trigger.location.yaw, 180.0);
        assert!(triggers[0].trigger.parameters.is_empty());
        assert_eq!(triggers[1].trigger.location.yaw, 0.0);
        assert!(triggers[1].trigger.parameters.contains_key("other_actors"));
    }

    #[test]
    fn test_unknown_scenario_type_rejected() {
        let json = r#"{"available_scenarios": [{"Town01": [
            {"scenario_type": "Scenario42", "available_event_configurations": []}
        ]}]}"#;
        let err = parse_scenarios(json, Path::new("s.json")).unwrap_err();
        assert!(matches!(err, CatalogError::UnknownScenarioType(ref t) if t == "Scenario42"));
    }

    #[test]
    fn test_invalid_json_rejected() {
        let err = parse_scenarios("{not json", Path::new("s.json")).unwrap_err();
        assert!(matches!(err, CatalogError::Json { .. }));

        let err = parse_scenarios(r#"{"scenarios": []}"#, Path::new("s.json")).unwrap_err();
        assert!(err.to_string().contains("available_scenarios"));
    }

    #[test]
    fn test_attach_respects_town_distance_and_heading() {
        let mut r = route("Town01", &[(0.0, 0.0, 90.0), (0.0, 20.0, 90.0)]);
        let triggers = vec![
            trigger("Town01", ScenarioType::Scenario1, 1.0, 1.0, 95.0),
            trigger("Town01", ScenarioType::Scenario2, 5.0, 0.0, 90.0),
            trigger("Town01", ScenarioType::Scenario3, 0.0, 20.0, 270.0),
            trigger("Town02", ScenarioType::Scenario4, 0.0, 0.0, 90.0),
        ];
        attach_triggers(&mut r, &triggers);
        assert_eq!(r.triggers.len(), 1);
        assert_eq!(r.triggers[0].scenario_type, ScenarioType::Scenario1);
    }

    #[test]
    fn test_attach_wraps_heading_and_deduplicates() {
        let mut r = route("Town01", &[(0.0, 0.0, 355.0), (0.5, 0.0, 355.0)]);
        let t = trigger("Town01", ScenarioType::Scenario7, 0.2, 0.0, 3.0);
        attach_triggers(&mut r, &[t.clone(), t]);
        assert_eq!(r.triggers.len(), 1);
    }

    #[test]
    fn test_yaw_difference() {
        assert_eq!(yaw_difference(10.0, 350.0), 20.0);
        assert_eq!(yaw_difference(-90.0, 270.0), 0.0);
        assert_eq!(yaw_difference(0.0, 180.0), 180.0);
    }
}
