use std::collections::HashMap;

use rust_decimal::Decimal;
use serde::Deserialize;

use crate::db::ticket::{Passengers, VehicleType};

/// Fares of a single crossing.
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct Tariff {
    pub adult: Decimal,
    pub child: Decimal,

    /// Surcharge per vehicle type, on top of the passenger fares. Missing
    /// types cost nothing extra.
    pub vehicles: HashMap<VehicleType, Decimal>,
}

impl Tariff {
    pub fn surcharge(&self, vehicle: VehicleType) -> Decimal {
        self.vehicles.get(&vehicle).copied().unwrap_or_default()
    }

    pub fn quote(
        &self,
        passengers: Passengers,
        vehicle: VehicleType,
    ) -> Decimal {
        self.adult * Decimal::from(passengers.adults)
            + self.child * Decimal::from(passengers.children)
            + self.surcharge(vehicle)
    }
}

impl Default for Tariff {
    fn default() -> Self {
        Self {
            adult: Decimal::from(40),
            child: Decimal::from(15),
            vehicles: HashMap::from([
                (VehicleType::OnFoot, Decimal::ZERO),
                (VehicleType::Motorcycle, Decimal::from(15)),
                (VehicleType::Car, Decimal::from(25)),
                (VehicleType::Pickup, Decimal::from(50)),
                (VehicleType::Van, Decimal::from(60)),
                (VehicleType::Truck, Decimal::from(75)),
                (VehicleType::Bus, Decimal::from(100)),
            ]),
        }
    }
}
