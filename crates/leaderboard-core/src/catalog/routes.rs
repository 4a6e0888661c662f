//! XML route catalog parsing.
//!
//! ```xml
//! <routes>
//!   <route id="0" town="Town01" weather="clear">
//!     <weather preset="rain"/>
//!     <waypoint x="338.7" y="226.7" z="0.0" pitch="0.0" roll="0.0" yaw="270.0"/>
//!   </route>
//! </routes>
//! ```

use std::collections::BTreeMap;
use std::path::Path;

use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;

use super::{RouteDescriptor, Waypoint, WeatherPreset};
use crate::error::CatalogError;

/// Parse a route catalog, preserving document order.
pub fn parse_routes(xml: &str, path: &Path) -> Result<Vec<RouteDescriptor>, CatalogError> {
    let mut reader = Reader::from_str(xml);
    reader.trim_text(true);

    let xml_error = |message: String| CatalogError::Xml {
        path: path.to_path_buf(),
        message,
    };

    let mut routes = Vec::new();
    let mut current: Option<RouteDescriptor> = None;

    loop {
        let event = reader.read_event().map_err(|e| {
            xml_error(format!("at byte {}: {}", reader.buffer_position(), e))
        })?;
        match event {
            Event::Start(e) => match e.name().as_ref() {
                b"route" => {
                    if let Some(open) = &current {
                        return Err(xml_error(format!(
                            "route {} is not closed before the next route starts",
                            open.id
                        )));
                    }
                    current = Some(start_route(&e).map_err(xml_error)?);
                }
                b"waypoint" => push_waypoint(current.as_mut(), &e, path)?,
                b"weather" => apply_weather(current.as_mut(), &e).map_err(xml_error)?,
                _ => {}
            },
            Event::Empty(e) => match e.name().as_ref() {
                b"waypoint" => push_waypoint(current.as_mut(), &e, path)?,
                b"weather" => apply_weather(current.as_mut(), &e).map_err(xml_error)?,
                b"route" => {
                    let route = start_route(&e).map_err(xml_error)?;
                    return Err(CatalogError::InvalidRoute {
                        route_id: route.id,
                        message: "route has no waypoints".into(),
                    });
                }
                _ => {}
            },
            Event::End(e) if e.name().as_ref() == b"route" => {
                let route = current
                    .take()
                    .ok_or_else(|| xml_error("unbalanced </route>".into()))?;
                finish_route(route, &mut routes)?;
            }
            Event::Eof => break,
            _ => {}
        }
    }

    if let Some(open) = current {
        return Err(xml_error(format!("route {} is never closed", open.id)));
    }
    Ok(routes)
}

/// Waypoints may be written self-closing or as an empty start/end pair.
fn push_waypoint(
    route: Option<&mut RouteDescriptor>,
    e: &BytesStart<'_>,
    path: &Path,
) -> Result<(), CatalogError> {
    let route = route.ok_or_else(|| CatalogError::Xml {
        path: path.to_path_buf(),
        message: "waypoint outside of a route".into(),
    })?;
    let waypoint = parse_waypoint(e).map_err(|message| CatalogError::InvalidRoute {
        route_id: route.id.clone(),
        message,
    })?;
    route.waypoints.push(waypoint);
    Ok(())
}

fn finish_route(route: RouteDescriptor, routes: &mut Vec<RouteDescriptor>) -> Result<(), CatalogError> {
    if route.waypoints.is_empty() {
        return Err(CatalogError::InvalidRoute {
            route_id: route.id,
            message: "route has no waypoints".into(),
        });
    }
    routes.push(route);
    Ok(())
}

fn start_route(e: &BytesStart<'_>) -> Result<RouteDescriptor, String> {
    let attrs = attributes(e)?;
    let id = attrs
        .get("id")
        .filter(|id| !id.trim().is_empty())
        .ok_or("route without id")?
        .trim()
        .to_string();
    let town = attrs
        .get("town")
        .or_else(|| attrs.get("map"))
        .ok_or_else(|| format!("route {id} has no town"))?
        .trim()
        .to_string();
    let weather = attrs
        .get("weather")
        .map(|w| w.parse::<WeatherPreset>())
        .transpose()
        .map_err(|e| format!("route {id}: {e}"))?;

    Ok(RouteDescriptor {
        id,
        town,
        waypoints: Vec::new(),
        weather,
        triggers: Vec::new(),
    })
}

fn apply_weather(route: Option<&mut RouteDescriptor>, e: &BytesStart<'_>) -> Result<(), String> {
    let route = route.ok_or("weather outside of a route")?;
    let attrs = attributes(e)?;
    if let Some(preset) = attrs.get("preset") {
        let preset = preset
            .parse::<WeatherPreset>()
            .map_err(|e| format!("route {}: {e}", route.id))?;
        route.weather = Some(preset);
    } else if !attrs.is_empty() {
        // Raw weather parameters without a named preset.
        route.weather = Some(WeatherPreset::Custom);
    }
    Ok(())
}

fn parse_waypoint(e: &BytesStart<'_>) -> Result<Waypoint, String> {
    let attrs = attributes(e)?;
    let number = |key: &str, required: bool| -> Result<f64, String> {
        match attrs.get(key) {
            Some(raw) => raw
                .trim()
                .parse::<f64>()
                .map_err(|_| format!("waypoint attribute {key}={raw:?} is not a number")),
            None if required => Err(format!("waypoint is missing {key}")),
            None => Ok(0.0),
        }
    };
    Ok(Waypoint {
        x: number("x", true)?,
        y: number("y", true)?,
        z: number("z", false)?,
        pitch: number("pitch", false)?,
        roll: number("roll", false)?,
        yaw: number("yaw", false)?,
    })
}

fn attributes(e: &BytesStart<'_>) -> Result<BTreeMap<String, String>, String> {
    let mut out = BTreeMap::new();
    for attr in e.attributes() {
        let attr = attr.map_err(|err| err.to_string())?;
        let key = String::from_utf8_lossy(attr.key.as_ref()).into_owned();
        let value = attr.unescape_value().map_err(|err| err.to_string())?;
        out.insert(key, value.into_owned());
    }
    Ok(out)
}
