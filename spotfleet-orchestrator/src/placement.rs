use spotfleet_common::{FleetError, PoolConfiguration};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Placement {
    pub region: String,
    /// None lets the provider pick a zone inside the region.
    pub zone: Option<String>,
}

/// Decides where new instances of a pool are launched.
pub trait PlacementPolicy: Send + Sync {
    fn choose(
        &self,
        region_preferences: &[String],
        config: &PoolConfiguration,
    ) -> Result<Placement, FleetError>;
}

/// Takes the first preferred region, and the configured zone when it lies in that region.
pub struct FirstPreferencePlacement;

impl PlacementPolicy for FirstPreferencePlacement {
    fn choose(
        &self,
        region_preferences: &[String],
        config: &PoolConfiguration,
    ) -> Result<Placement, FleetError> {
        let region = region_preferences
            .iter()
            .map(|r| r.trim())
            .find(|r| !r.is_empty())
            .ok_or_else(|| {
                FleetError::Config(format!(
                    "configuration '{}' has no region preference",
                    config.name
                ))
            })?;
        let zone = config
            .zone
            .as_deref()
            .filter(|z| z.starts_with(region))
            .map(str::to_string);
        Ok(Placement {
            region: region.to_string(),
            zone,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use spotfleet_common::ImageTemplate;
    use std::collections::BTreeMap;
    use uuid::Uuid;

    fn config(regions: &[&str], zone: Option<&str>) -> PoolConfiguration {
        PoolConfiguration {
            id: Uuid::new_v4(),
            name: "cfg".to_string(),
            size: 1,
            cycle_interval_secs: 0,
            max_price: 0.1,
            image: ImageTemplate::default(),
            tags: BTreeMap::new(),
            credentials: None,
            userdata: None,
            userdata_macros: BTreeMap::new(),
            regions: regions.iter().map(|r| r.to_string()).collect(),
            zone: zone.map(str::to_string),
        }
    }

    #[test]
    fn picks_first_region_and_matching_zone() {
        let cfg = config(&["us-east-1", "us-west-2"], Some("us-east-1d"));
        let placement = FirstPreferencePlacement.choose(&cfg.regions, &cfg).unwrap();
        assert_eq!(
            placement,
            Placement {
                region: "us-east-1".to_string(),
                zone: Some("us-east-1d".to_string()),
            }
        );
    }

    #[test]
    fn ignores_zone_from_another_region() {
        let cfg = config(&["eu-west-1"], Some("us-east-1d"));
        let placement = FirstPreferencePlacement.choose(&cfg.regions, &cfg).unwrap();
        assert_eq!(placement.region, "eu-west-1");
        assert_eq!(placement.zone, None);
    }

    #[test]
    fn no_region_is_a_configuration_error() {
        let cfg = config(&[], None);
        assert!(matches!(
            FirstPreferencePlacement.choose(&cfg.regions, &cfg),
            Err(FleetError::Config(_))
        ));
    }
}
