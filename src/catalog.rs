// 🗂️ Reference Catalogs - Known zones, stations and species for one project
//
// Catalogs are pre-fetched before an import starts and never refreshed mid-batch.
// Every lookup here is read-only; new species found during an import live in
// the reconciliation accumulator, not in the catalog.

use serde::{Deserialize, Serialize};

// ============================================================================
// ENTITIES
// ============================================================================

/// Survey zone. Zones form a tree: root zones have no parent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Zone {
    pub id: String,
    pub label: String,
    pub parent_id: Option<String>,
}

impl Zone {
    pub fn new(id: impl Into<String>, label: impl Into<String>) -> Self {
        Zone {
            id: id.into(),
            label: label.into(),
            parent_id: None,
        }
    }

    /// Builder: attach to a parent zone
    pub fn with_parent(mut self, parent_id: impl Into<String>) -> Self {
        self.parent_id = Some(parent_id.into());
        self
    }

    pub fn is_root(&self) -> bool {
        self.parent_id.is_none()
    }
}

/// Camera station. Unique by (name, zone).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Station {
    pub id: String,
    pub name: String,
    pub zone_id: String,
}

impl Station {
    pub fn new(id: impl Into<String>, name: impl Into<String>, zone_id: impl Into<String>) -> Self {
        Station {
            id: id.into(),
            name: name.into(),
            zone_id: zone_id.into(),
        }
    }
}

/// Persisted species
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Species {
    pub id: String,
    pub label: String,
}

impl Species {
    pub fn new(id: impl Into<String>, label: impl Into<String>) -> Self {
        Species {
            id: id.into(),
            label: label.into(),
        }
    }
}

/// Species authorized for the project
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectSpeciesLink {
    pub project_id: String,
    pub species_id: String,
}

// ============================================================================
// REFERENCE CATALOGS
// ============================================================================

/// Read-only snapshot of everything a project import resolves against
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReferenceCatalogs {
    pub project_id: String,
    pub zones: Vec<Zone>,
    pub stations: Vec<Station>,
    pub species: Vec<Species>,
    pub project_species: Vec<ProjectSpeciesLink>,
}

impl ReferenceCatalogs {
    pub fn new(project_id: impl Into<String>) -> Self {
        ReferenceCatalogs {
            project_id: project_id.into(),
            ..Default::default()
        }
    }

    pub fn with_zone(mut self, zone: Zone) -> Self {
        self.zones.push(zone);
        self
    }

    pub fn with_station(mut self, station: Station) -> Self {
        self.stations.push(station);
        self
    }

    pub fn with_species(mut self, species: Species) -> Self {
        self.species.push(species);
        self
    }

    /// Add a species and authorize it for this project in one step
    pub fn with_project_species(mut self, species: Species) -> Self {
        self.project_species.push(ProjectSpeciesLink {
            project_id: self.project_id.clone(),
            species_id: species.id.clone(),
        });
        self.species.push(species);
        self
    }

    pub fn zone_by_id(&self, id: &str) -> Option<&Zone> {
        self.zones.iter().find(|z| z.id == id)
    }

    /// Resolve a zone by exact label.
    ///
    /// When `sub_label` is non-empty the sub-zone wins: a zone labelled
    /// `sub_label` whose parent is labelled `label` is preferred, otherwise
    /// any zone labelled `sub_label`.
    pub fn find_zone(&self, label: &str, sub_label: Option<&str>) -> Option<&Zone> {
        match sub_label.filter(|s| !s.is_empty()) {
            Some(sub) => {
                let nested = self.zones.iter().find(|z| {
                    z.label == sub
                        && z
                            .parent_id
                            .as_deref()
                            .and_then(|pid| self.zone_by_id(pid))
                            .map_or(false, |parent| parent.label == label)
                });
                nested.or_else(|| self.zones.iter().find(|z| z.label == sub))
            }
            None => self.zones.iter().find(|z| z.label == label),
        }
    }

    /// Resolve a station by name inside a zone.
    ///
    /// (name, zone) is unique in a well-formed catalog; if it is not, the
    /// last matching entry wins.
    pub fn find_station(&self, name: &str, zone_id: &str) -> Option<&Station> {
        self.stations
            .iter()
            .filter(|s| s.name == name && s.zone_id == zone_id)
            .last()
    }

    /// Resolve a persisted species by exact label
    pub fn find_species(&self, label: &str) -> Option<&Species> {
        self.species.iter().find(|s| s.label == label)
    }

    /// Is the species authorized for this project?
    pub fn is_linked(&self, species_id: &str) -> bool {
        self.project_species
            .iter()
            .any(|link| link.species_id == species_id)
    }

    /// Species authorized for this project, in link order
    pub fn project_species(&self) -> Vec<&Species> {
        self.project_species
            .iter()
            .filter_map(|link| self.species.iter().find(|s| s.id == link.species_id))
            .collect()
    }
}

// ============================================================================
// PROVIDER
// ============================================================================

/// Source of catalog snapshots. Called once per import, before the first row.
pub trait CatalogProvider {
    type Error;

    fn load_catalogs(&self, project_id: &str) -> Result<ReferenceCatalogs, Self::Error>;
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn create_test_catalogs() -> ReferenceCatalogs {
        ReferenceCatalogs::new("project-1")
            .with_zone(Zone::new("z-north", "North"))
            .with_zone(Zone::new("z-south", "South"))
            .with_zone(Zone::new("z-north-a", "Ridge").with_parent("z-north"))
            .with_zone(Zone::new("z-south-a", "Ridge").with_parent("z-south"))
            .with_station(Station::new("s-1", "Cam 1", "z-north"))
            .with_station(Station::new("s-2", "Cam 1", "z-south"))
            .with_project_species(Species::new("sp-deer", "Deer"))
            .with_species(Species::new("sp-boar", "Boar"))
    }

    #[test]
    fn test_find_zone_by_label() {
        let catalogs = create_test_catalogs();

        let zone = catalogs.find_zone("North", None).unwrap();
        assert_eq!(zone.id, "z-north");
        assert!(zone.is_root());

        assert!(catalogs.find_zone("East", None).is_none());
    }

    #[test]
    fn test_find_zone_prefers_sub_zone_under_parent() {
        let catalogs = create_test_catalogs();

        let zone = catalogs.find_zone("South", Some("Ridge")).unwrap();
        assert_eq!(zone.id, "z-south-a");

        let zone = catalogs.find_zone("North", Some("Ridge")).unwrap();
        assert_eq!(zone.id, "z-north-a");
    }

    #[test]
    fn test_find_zone_sub_zone_fallback() {
        let catalogs = create_test_catalogs();

        // Parent label doesn't match anything, any "Ridge" is accepted
        let zone = catalogs.find_zone("Nowhere", Some("Ridge")).unwrap();
        assert_eq!(zone.label, "Ridge");

        // Empty sub-zone means the zone column's own value
        let zone = catalogs.find_zone("South", Some("")).unwrap();
        assert_eq!(zone.id, "z-south");
    }

    #[test]
    fn test_find_station_filters_by_zone() {
        let catalogs = create_test_catalogs();

        assert_eq!(catalogs.find_station("Cam 1", "z-north").unwrap().id, "s-1");
        assert_eq!(catalogs.find_station("Cam 1", "z-south").unwrap().id, "s-2");
        assert!(catalogs.find_station("Cam 1", "z-north-a").is_none());
    }

    #[test]
    fn test_find_station_last_duplicate_wins() {
        let catalogs = create_test_catalogs().with_station(Station::new("s-3", "Cam 1", "z-north"));

        assert_eq!(catalogs.find_station("Cam 1", "z-north").unwrap().id, "s-3");
    }

    #[test]
    fn test_species_link() {
        let catalogs = create_test_catalogs();

        assert!(catalogs.is_linked("sp-deer"));
        assert!(!catalogs.is_linked("sp-boar"));
        assert_eq!(catalogs.find_species("Boar").unwrap().id, "sp-boar");

        let linked: Vec<&str> = catalogs.project_species().iter().map(|s| s.label.as_str()).collect();
        assert_eq!(linked, vec!["Deer"]);
    }
}
