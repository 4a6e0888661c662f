//! Route and scenario catalogs.
//!
//! Routes come from an XML catalog, scenario triggers from a JSON catalog keyed by town.
//! Triggers are attached to the routes they lie on when the catalogs are loaded; after that
//! everything here is immutable data.

mod routes;
mod scenarios;

use std::fmt;
use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::CatalogError;

pub use routes::parse_routes;
pub use scenarios::{attach_triggers, parse_scenarios, TownTrigger};

/// Planar distance under which a trigger is considered to lie on a route waypoint.
pub const TRIGGER_DISTANCE_M: f64 = 2.0;

/// Maximum heading difference between a trigger and the waypoint it matches.
pub const TRIGGER_ANGLE_DEG: f64 = 10.0;

/// Fixed scenario-type vocabulary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ScenarioType {
    Scenario1,
    Scenario2,
    Scenario3,
    Scenario4,
    Scenario5,
    Scenario6,
    Scenario7,
    Scenario8,
    Scenario9,
    Scenario10,
}

impl ScenarioType {
    pub const ALL: [ScenarioType; 10] = [
        ScenarioType::Scenario1,
        ScenarioType::Scenario2,
        ScenarioType::Scenario3,
        ScenarioType::Scenario4,
        ScenarioType::Scenario5,
        ScenarioType::Scenario6,
        ScenarioType::Scenario7,
        ScenarioType::Scenario8,
        ScenarioType::Scenario9,
        ScenarioType::Scenario10,
    ];

    pub fn number(&self) -> u8 {
        *self as u8 + 1
    }
}

impl fmt::Display for ScenarioType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Scenario{}", self.number())
    }
}

impl FromStr for ScenarioType {
    type Err = CatalogError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        trimmed
            .strip_prefix("Scenario")
            .and_then(|n| n.parse::<u8>().ok())
            .and_then(|n| Self::ALL.get(usize::from(n).checked_sub(1)?).copied())
            .ok_or_else(|| CatalogError::UnknownScenarioType(trimmed.to_string()))
    }
}

/// Weather preset applied to a route.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WeatherPreset {
    Clear,
    Cloudy,
    Wet,
    Rain,
    HeavyRain,
    Fog,
    Night,
    Custom,
}

impl FromStr for WeatherPreset {
    type Err = CatalogError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "clear" => Ok(WeatherPreset::Clear),
            "cloudy" => Ok(WeatherPreset::Cloudy),
            "wet" => Ok(WeatherPreset::Wet),
            "rain" => Ok(WeatherPreset::Rain),
            "heavy_rain" => Ok(WeatherPreset::HeavyRain),
            "fog" => Ok(WeatherPreset::Fog),
            "night" => Ok(WeatherPreset::Night),
            "custom" => Ok(WeatherPreset::Custom),
            _ => Err(CatalogError::UnknownWeather(s.to_string())),
        }
    }
}

/// A pose along a route. Angles in degrees.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Waypoint {
    pub x: f64,
    pub y: f64,
    pub z: f64,
    pub pitch: f64,
    pub roll: f64,
    pub yaw: f64,
}

impl Waypoint {
    pub fn planar_distance(&self, x: f64, y: f64) -> f64 {
        ((self.x - x).powi(2) + (self.y - y).powi(2)).sqrt()
    }
}

/// Location and heading at which a scenario is triggered.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct TriggerLocation {
    pub x: f64,
    pub y: f64,
    pub z: f64,
    pub yaw: f64,
}

/// A scenario placed along a route.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScenarioTrigger {
    pub scenario_type: ScenarioType,
    pub location: TriggerLocation,
    /// Everything in the catalog entry besides the trigger transform.
    #[serde(default)]
    pub parameters: serde_json::Map<String, serde_json::Value>,
}

/// A fixed path through a town that the agent has to complete.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouteDescriptor {
    pub id: String,
    pub town: String,
    pub waypoints: Vec<Waypoint>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub weather: Option<WeatherPreset>,
    #[serde(default)]
    pub triggers: Vec<ScenarioTrigger>,
}

impl RouteDescriptor {
    pub fn has_scenario(&self, scenario_type: ScenarioType) -> bool {
        self.triggers
            .iter()
            .any(|t| t.scenario_type == scenario_type)
    }
}

/// Ordered routes with their scenario triggers attached.
#[derive(Debug, Clone, PartialEq)]
pub struct RouteCatalog {
    routes: Vec<RouteDescriptor>,
}

impl RouteCatalog {
    /// Build a catalog from already-parsed routes. Route ids must be unique.
    pub fn new(routes: Vec<RouteDescriptor>) -> Result<Self, CatalogError> {
        let mut seen = std::collections::HashSet::new();
        for route in &routes {
            if !seen.insert(route.id.as_str()) {
                return Err(CatalogError::DuplicateRoute {
                    route_id: route.id.clone(),
                });
            }
        }
        Ok(Self { routes })
    }

    /// Load the XML route catalog and attach triggers from the JSON scenario catalog.
    pub fn load(routes_path: &Path, scenarios_path: &Path) -> Result<Self, CatalogError> {
        let xml = read(routes_path)?;
        let mut routes = parse_routes(&xml, routes_path)?;
        if routes.is_empty() {
            return Err(CatalogError::Empty {
                path: routes_path.to_path_buf(),
            });
        }

        let json = read(scenarios_path)?;
        let triggers = parse_scenarios(&json, scenarios_path)?;
        for route in &mut routes {
            attach_triggers(route, &triggers);
        }

        let catalog = Self::new(routes)?;
        tracing::debug!(
            routes = catalog.len(),
            triggers = triggers.len(),
            "loaded route catalog"
        );
        Ok(catalog)
    }

    pub fn routes(&self) -> &[RouteDescriptor] {
        &self.routes
    }

    pub fn get(&self, route_id: &str) -> Option<&RouteDescriptor> {
        self.routes.iter().find(|r| r.id == route_id)
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

fn read(path: &Path) -> Result<String, CatalogError> {
    std::fs::read_to_string(path).map_err(|source| CatalogError::Io {
        path: path.to_path_buf(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scenario_type_roundtrip() {
        for ty in ScenarioType::ALL {
            assert_eq!(ty.to_string().parse::<ScenarioType>().unwrap(), ty);
        }
        assert!("Scenario0".parse::<ScenarioType>().is_err());
        assert!("Scenario11".parse::<ScenarioType>().is_err());
        assert!("ControlLoss".parse::<ScenarioType>().is_err());
    }

    #[test]
    fn test_weather_parsing() {
        assert_eq!("Heavy_Rain".parse::<WeatherPreset>().unwrap(), WeatherPreset::HeavyRain);
        assert!(matches!(
            "sandstorm".parse::<WeatherPreset>(),
            Err(CatalogError::UnknownWeather(_))
        ));
    }

    #[test]
    fn test_duplicate_route_ids_rejected() {
        let route = RouteDescriptor {
            id: "7".into(),
            town: "Town01".into(),
            waypoints: vec![Waypoint::default()],
            weather: None,
            triggers: vec![],
        };
        let err = RouteCatalog::new(vec![route.clone(), route]).unwrap_err();
        assert!(matches!(err, CatalogError::DuplicateRoute { .. }));
    }

    #[test]
    fn test_load_attaches_triggers() {
        let dir = tempfile::tempdir().unwrap();
        let routes = dir.path().join("routes.xml");
        let scenarios = dir.path().join("scenarios.json");
        std::fs::write(
            &routes,
            r#"<routes>
                 <route id="0" town="Town01">
                   <waypoint x="0.0" y="0.0" z="0.0" yaw="90.0"/>
                   <waypoint x="0.0" y="50.0" z="0.0" yaw="90.0"/>
                 </route>
                 <route id="1" town="Town02">
                   <waypoint x="10.0" y="10.0" z="0.0" yaw="0.0"/>
                 </route>
               </routes>"#,
        )
        .unwrap();
        std::fs::write(
            &scenarios,
            r#"{"available_scenarios": [{"Town01": [{
                 "scenario_type": "Scenario3",
                 "available_event_configurations": [
                   {"transform": {"x": "0.5", "y": "49.0", "z": "0.0", "yaw": "92.0"}}
                 ]}]}]}"#,
        )
        .unwrap();

        let catalog = RouteCatalog::load(&routes, &scenarios).unwrap();
        assert_eq!(catalog.len(), 2);
        assert!(catalog.get("0").unwrap().has_scenario(ScenarioType::Scenario3));
        assert!(catalog.get("1").unwrap().triggers.is_empty());
    }

    #[test]
    fn test_load_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = RouteCatalog::load(&dir.path().join("a.xml"), &dir.path().join("b.json"))
            .unwrap_err();
        assert!(matches!(err, CatalogError::Io { .. }));
    }
}
