//! Location hierarchy model.
//!
//! Providers expose their geography as a tree of provider, region, zone and
//! host tiers. Some providers skip tiers (a zone hanging directly off the
//! provider, for example), so the walk to the provider root tolerates a single
//! missing level. Parents are stored as identifiers and resolved through a
//! [`LocationRegistry`], never as live references.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use thiserror::Error;

use crate::types::LocationId;

/// Tier of a location in the provider hierarchy.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum LocationScope {
    /// The provider itself; always the root.
    Provider,
    /// A geographic region.
    Region,
    /// An availability zone or data centre.
    Zone,
    /// A single physical host.
    Host,
}

impl LocationScope {
    /// Lower-case name of the scope.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Provider => "provider",
            Self::Region => "region",
            Self::Zone => "zone",
            Self::Host => "host",
        }
    }
}

impl fmt::Display for LocationScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LocationScope {
    type Err = LocationError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "provider" => Ok(Self::Provider),
            "region" => Ok(Self::Region),
            "zone" => Ok(Self::Zone),
            "host" => Ok(Self::Host),
            other => Err(LocationError::UnsupportedScope(other.to_owned())),
        }
    }
}

/// A node placement target.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct Location {
    /// Provider-unique identifier.
    pub id: LocationId,
    /// Tier of this location.
    pub scope: LocationScope,
    /// Human readable description.
    pub description: String,
    /// Identifier of the owning location, `None` at the root.
    pub parent: Option<LocationId>,
}

impl Location {
    /// Creates a location.
    #[must_use]
    pub fn new(
        id: impl Into<LocationId>,
        scope: LocationScope,
        description: impl Into<String>,
        parent: Option<LocationId>,
    ) -> Self {
        Self {
            id: id.into(),
            scope,
            description: description.into(),
            parent,
        }
    }

    /// Creates a parent-less provider location.
    #[must_use]
    pub fn provider(id: impl Into<LocationId>, description: impl Into<String>) -> Self {
        Self::new(id, LocationScope::Provider, description, None)
    }

    /// Creates a location owned by `parent`.
    #[must_use]
    pub fn child_of(
        parent: &Self,
        id: impl Into<LocationId>,
        scope: LocationScope,
        description: impl Into<String>,
    ) -> Self {
        Self::new(id, scope, description, Some(parent.id.clone()))
    }
}

/// Errors raised while building or walking a location hierarchy.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum LocationError {
    /// Raised for scope names outside provider, region, zone and host.
    #[error("unsupported location scope: {0}")]
    UnsupportedScope(String),
    /// Raised when a location names itself as parent.
    #[error("location {id} is its own parent")]
    SelfParent {
        /// Offending location.
        id: LocationId,
    },
    /// Raised when two locations share an identifier.
    #[error("location {id} is defined more than once")]
    Duplicate {
        /// Repeated identifier.
        id: LocationId,
    },
    /// Raised when a lookup targets an unregistered location.
    #[error("location {id} is not registered")]
    Unknown {
        /// Identifier that was looked up.
        id: LocationId,
    },
    /// Raised when a parent identifier does not resolve.
    #[error("location {id} refers to unknown parent {parent}")]
    DanglingParent {
        /// Child location.
        id: LocationId,
        /// Parent identifier that could not be resolved.
        parent: LocationId,
    },
    /// Raised when a non-provider tier has no parent.
    #[error("{scope} location {id} has no parent")]
    MissingParent {
        /// Location lacking a parent.
        id: LocationId,
        /// Its scope.
        scope: LocationScope,
    },
    /// Raised when the hierarchy walk does not end on a parent-less provider.
    #[error("location {id} resolves to {resolved}, which is not a root provider")]
    NotAProvider {
        /// Location whose ancestry was walked.
        id: LocationId,
        /// Location the walk ended on.
        resolved: LocationId,
    },
    /// Raised when the parent chain loops.
    #[error("parent chain of location {id} does not terminate")]
    Cycle {
        /// Location whose ancestry was walked.
        id: LocationId,
    },
}

/// Owned set of locations indexed by identifier.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct LocationRegistry {
    locations: BTreeMap<LocationId, Location>,
}

impl LocationRegistry {
    /// Builds a registry, rejecting self-parented, duplicated and dangling
    /// entries.
    ///
    /// # Errors
    ///
    /// Returns [`LocationError::SelfParent`], [`LocationError::Duplicate`] or
    /// [`LocationError::DanglingParent`].
    pub fn new(locations: impl IntoIterator<Item = Location>) -> Result<Self, LocationError> {
        let mut index = BTreeMap::new();
        for location in locations {
            if location.parent.as_ref() == Some(&location.id) {
                return Err(LocationError::SelfParent { id: location.id });
            }
            let id = location.id.clone();
            if index.insert(id.clone(), location).is_some() {
                return Err(LocationError::Duplicate { id });
            }
        }

        let registry = Self { locations: index };
        for location in registry.locations.values() {
            registry.parent(location)?;
        }
        Ok(registry)
    }

    /// Number of registered locations.
    #[must_use]
    pub fn len(&self) -> usize {
        self.locations.len()
    }

    /// Returns `true` when no locations are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.locations.is_empty()
    }

    /// Iterates over locations in identifier order.
    pub fn iter(&self) -> impl Iterator<Item = &Location> {
        self.locations.values()
    }

    /// Looks up a location by identifier.
    #[must_use]
    pub fn get(&self, id: &LocationId) -> Option<&Location> {
        self.locations.get(id)
    }

    /// Looks up a location, failing when it is unknown.
    ///
    /// # Errors
    ///
    /// Returns [`LocationError::Unknown`] when `id` is not registered.
    pub fn require(&self, id: &LocationId) -> Result<&Location, LocationError> {
        self.get(id)
            .ok_or_else(|| LocationError::Unknown { id: id.clone() })
    }

    /// Returns the owning location, or `None` at the top of the hierarchy.
    ///
    /// # Errors
    ///
    /// Returns [`LocationError::DanglingParent`] when the parent identifier
    /// is not registered.
    pub fn parent(&self, location: &Location) -> Result<Option<&Location>, LocationError> {
        let Some(parent_id) = location.parent.as_ref() else {
            return Ok(None);
        };
        self.get(parent_id)
            .map(Some)
            .ok_or_else(|| LocationError::DanglingParent {
                id: location.id.clone(),
                parent: parent_id.clone(),
            })
    }

    fn required_parent<'a>(&'a self, location: &Location) -> Result<&'a Location, LocationError> {
        self.parent(location)?
            .ok_or_else(|| LocationError::MissingParent {
                id: location.id.clone(),
                scope: location.scope,
            })
    }

    /// Returns the ancestors of `location`, nearest first.
    ///
    /// # Errors
    ///
    /// Returns [`LocationError::Cycle`] when the chain revisits a location and
    /// [`LocationError::DanglingParent`] when it breaks.
    pub fn ancestors<'a>(&'a self, location: &Location) -> Result<Vec<&'a Location>, LocationError> {
        let mut chain: Vec<&Location> = Vec::new();
        let mut current = self.parent(location)?;
        while let Some(ancestor) = current {
            if ancestor.id == location.id || chain.len() >= self.locations.len() {
                return Err(LocationError::Cycle {
                    id: location.id.clone(),
                });
            }
            chain.push(ancestor);
            current = self.parent(ancestor)?;
        }
        Ok(chain)
    }

    /// Resolves the provider root of `location` following its scope.
    ///
    /// Regions must hang off the provider. Zones normally sit under a region
    /// but may hang off the provider directly; hosts likewise may skip one
    /// tier.
    ///
    /// # Errors
    ///
    /// Returns [`LocationError::MissingParent`] when a required tier is
    /// absent and [`LocationError::NotAProvider`] when the walk ends on
    /// anything but a parent-less provider.
    pub fn provider_of<'a>(&'a self, location: &'a Location) -> Result<&'a Location, LocationError> {
        let resolved = match location.scope {
            LocationScope::Provider => location,
            LocationScope::Region => self.required_parent(location)?,
            LocationScope::Zone => {
                let parent = self.required_parent(location)?;
                self.parent(parent)?.unwrap_or(parent)
            }
            LocationScope::Host => {
                let parent = self.required_parent(location)?;
                let grandparent = self.required_parent(parent)?;
                self.parent(grandparent)?.unwrap_or(grandparent)
            }
        };

        if resolved.scope == LocationScope::Provider && resolved.parent.is_none() {
            Ok(resolved)
        } else {
            Err(LocationError::NotAProvider {
                id: location.id.clone(),
                resolved: resolved.id.clone(),
            })
        }
    }

    /// Checks every registered location resolves to a provider root.
    ///
    /// # Errors
    ///
    /// Returns the first [`LocationError`] encountered.
    pub fn validate(&self) -> Result<(), LocationError> {
        for location in self.locations.values() {
            self.provider_of(location)?;
            self.ancestors(location)?;
        }
        Ok(())
    }

    /// Returns `true` when `candidate` equals `expected` or descends from it.
    ///
    /// # Errors
    ///
    /// Returns [`LocationError::Unknown`] when `candidate` is not registered,
    /// or any error raised while walking its ancestry.
    pub fn is_same_or_child(
        &self,
        candidate: &LocationId,
        expected: &LocationId,
    ) -> Result<bool, LocationError> {
        if candidate == expected {
            return Ok(true);
        }
        let location = self.require(candidate)?;
        Ok(self
            .ancestors(location)?
            .iter()
            .any(|ancestor| &ancestor.id == expected))
    }

    /// Direct children of `id`, in identifier order.
    pub fn children_of<'a>(&'a self, id: &'a LocationId) -> impl Iterator<Item = &'a Location> {
        self.locations
            .values()
            .filter(move |location| location.parent.as_ref() == Some(id))
    }

    /// Default placement: the first zone, else region, else provider, by
    /// identifier.
    #[must_use]
    pub fn default_location(&self) -> Option<&Location> {
        [
            LocationScope::Zone,
            LocationScope::Region,
            LocationScope::Provider,
        ]
        .into_iter()
        .find_map(|scope| {
            self.locations
                .values()
                .find(|location| location.scope == scope)
        })
    }

    /// Every location, default first, then zones, regions, providers and
    /// hosts, each in identifier order.
    #[must_use]
    pub fn search_order(&self) -> Vec<&Location> {
        let default = self.default_location();
        let mut ordered: Vec<&Location> = default.into_iter().collect();
        for scope in [
            LocationScope::Zone,
            LocationScope::Region,
            LocationScope::Provider,
            LocationScope::Host,
        ] {
            ordered.extend(self.locations.values().filter(|location| {
                location.scope == scope && default.is_none_or(|first| first.id != location.id)
            }));
        }
        ordered
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::{fixture, rstest};

    #[fixture]
    fn hierarchy() -> LocationRegistry {
        let provider = Location::provider("scaleway", "Scaleway");
        let region = Location::child_of(&provider, "fr-par", LocationScope::Region, "Paris");
        let zone = Location::child_of(&region, "fr-par-1", LocationScope::Zone, "Paris 1");
        let flat_zone = Location::child_of(&provider, "edge-1", LocationScope::Zone, "Edge");
        let host = Location::child_of(&zone, "host-a", LocationScope::Host, "Rack A");
        let flat_host = Location::child_of(&flat_zone, "host-b", LocationScope::Host, "Rack B");
        LocationRegistry::new([provider, region, zone, flat_zone, host, flat_host])
            .unwrap_or_else(|err| panic!("fixture hierarchy should be valid: {err}"))
    }

    #[rstest]
    #[case("scaleway")]
    #[case("fr-par")]
    #[case("fr-par-1")]
    #[case("edge-1")]
    #[case("host-a")]
    #[case("host-b")]
    fn every_tier_resolves_to_the_provider(hierarchy: LocationRegistry, #[case] id: &str) {
        let location = hierarchy
            .require(&LocationId::from(id))
            .unwrap_or_else(|err| panic!("lookup {id}: {err}"));
        let provider = hierarchy
            .provider_of(location)
            .unwrap_or_else(|err| panic!("resolve {id}: {err}"));
        assert_eq!(provider.id.as_str(), "scaleway");
        assert_eq!(provider.scope, LocationScope::Provider);
        assert!(provider.parent.is_none());
        assert_ne!(location.parent.as_ref(), Some(&location.id));
    }

    #[rstest]
    fn validate_accepts_flattened_hierarchy(hierarchy: LocationRegistry) {
        assert_eq!(hierarchy.validate(), Ok(()));
    }

    #[rstest]
    #[case("fr-par-1", "fr-par-1", true)]
    #[case("fr-par-1", "fr-par", true)]
    #[case("host-a", "scaleway", true)]
    #[case("fr-par", "fr-par-1", false)]
    #[case("edge-1", "fr-par", false)]
    fn same_or_child(
        hierarchy: LocationRegistry,
        #[case] candidate: &str,
        #[case] expected: &str,
        #[case] outcome: bool,
    ) {
        let result =
            hierarchy.is_same_or_child(&LocationId::from(candidate), &LocationId::from(expected));
        assert_eq!(result, Ok(outcome));
    }

    #[test]
    fn self_parent_is_rejected() {
        let looped = Location::new(
            "loop",
            LocationScope::Zone,
            "loop",
            Some(LocationId::from("loop")),
        );
        assert_eq!(
            LocationRegistry::new([looped]),
            Err(LocationError::SelfParent {
                id: LocationId::from("loop")
            })
        );
    }

    #[test]
    fn dangling_parent_is_rejected() {
        let orphan = Location::new(
            "orphan",
            LocationScope::Zone,
            "orphan",
            Some(LocationId::from("missing")),
        );
        assert!(matches!(
            LocationRegistry::new([orphan]),
            Err(LocationError::DanglingParent { .. })
        ));
    }

    #[test]
    fn region_under_region_is_not_a_provider() {
        let provider = Location::provider("p", "p");
        let region = Location::child_of(&provider, "r", LocationScope::Region, "r");
        let nested = Location::child_of(&region, "r2", LocationScope::Region, "r2");
        let registry = LocationRegistry::new([provider, region, nested])
            .unwrap_or_else(|err| panic!("registry: {err}"));
        assert!(matches!(
            registry.validate(),
            Err(LocationError::NotAProvider { .. })
        ));
    }

    #[test]
    fn parent_cycles_are_detected() {
        let first = Location::new("a", LocationScope::Zone, "a", Some(LocationId::from("b")));
        let second = Location::new("b", LocationScope::Region, "b", Some(LocationId::from("a")));
        let registry = LocationRegistry::new([first, second])
            .unwrap_or_else(|err| panic!("registry: {err}"));
        let location = registry
            .require(&LocationId::from("a"))
            .unwrap_or_else(|err| panic!("lookup: {err}"));
        assert!(matches!(
            registry.ancestors(location),
            Err(LocationError::Cycle { .. })
        ));
    }

    #[test]
    fn zone_without_parent_is_rejected() {
        let registry =
            LocationRegistry::new([Location::new("z", LocationScope::Zone, "z", None)])
                .unwrap_or_else(|err| panic!("registry: {err}"));
        assert!(matches!(
            registry.validate(),
            Err(LocationError::MissingParent { .. })
        ));
    }

    #[rstest]
    #[case("PROVIDER", Ok(LocationScope::Provider))]
    #[case("zone", Ok(LocationScope::Zone))]
    #[case("network", Err(LocationError::UnsupportedScope(String::from("network"))))]
    fn scope_parsing(#[case] raw: &str, #[case] expected: Result<LocationScope, LocationError>) {
        assert_eq!(raw.parse::<LocationScope>(), expected);
    }

    #[rstest]
    fn default_location_prefers_zones(hierarchy: LocationRegistry) {
        let chosen = hierarchy
            .default_location()
            .map(|location| location.id.as_str().to_owned());
        assert_eq!(chosen.as_deref(), Some("edge-1"));
    }

    #[rstest]
    fn search_order_starts_at_the_default(hierarchy: LocationRegistry) {
        let order: Vec<_> = hierarchy
            .search_order()
            .into_iter()
            .map(|location| location.id.as_str())
            .collect();
        assert_eq!(
            order,
            ["edge-1", "fr-par-1", "fr-par", "scaleway", "host-a", "host-b"]
        );
    }
}
