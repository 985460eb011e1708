//! Real Taipei-area delivery locations for realistic test fixtures.
//!
//! Coordinates sourced from OpenStreetMap. Distances between these points
//! are small enough that a full day plan stays inside the default
//! constraint limits.

use delivery_routing::model::Location;

/// A named place with coordinates.
#[derive(Debug, Clone)]
pub struct Place {
    pub name: &'static str,
    pub lat: f64,
    pub lng: f64,
}

impl Place {
    pub const fn new(name: &'static str, lat: f64, lng: f64) -> Self {
        Self { name, lat, lng }
    }

    pub fn location(&self) -> Location {
        Location::new(self.lat, self.lng)
    }
}

/// Distribution centers (route start points).
pub const WAREHOUSES: &[Place] = &[
    Place::new("Neihu Distribution Center", 25.0670, 121.5850),
    Place::new("Banqiao Distribution Center", 25.0140, 121.4640),
];

/// Delivery addresses across Taipei districts.
pub const CUSTOMERS: &[Place] = &[
    Place::new("Taipei 101", 25.0339, 121.5645),
    Place::new("Taipei Main Station", 25.0478, 121.5170),
    Place::new("Shilin Night Market", 25.0881, 121.5254),
    Place::new("Songshan Airport", 25.0632, 121.5523),
    Place::new("National Taiwan University", 25.0174, 121.5405),
    Place::new("Raohe Street", 25.0509, 121.5772),
    Place::new("Dadaocheng Wharf", 25.0564, 121.5085),
    Place::new("Xinyi Eslite", 25.0393, 121.5652),
    Place::new("Technology Building", 25.0261, 121.5435),
    Place::new("Nangang Software Park", 25.0585, 121.6158),
    Place::new("Miramar Ferris Wheel", 25.0830, 121.5570),
    Place::new("Wanhua Longshan Temple", 25.0371, 121.4999),
    Place::new("Daan Forest Park", 25.0297, 121.5358),
    Place::new("Zhongshan Hall", 25.0432, 121.5101),
    Place::new("Tianmu Baseball Stadium", 25.1173, 121.5350),
    Place::new("Guandu Temple", 25.1175, 121.4675),
];
