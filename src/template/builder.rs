//! Criteria-driven template resolution.

use super::{
    Catalog, Image, OsFamily, Size, Template, TemplateError, TemplateOptions, compare_versions,
};
use crate::location::Location;
use crate::types::{ImageId, LocationId, SizeId};

/// Which end of the matching sizes to pick.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq)]
pub enum SizePreference {
    /// Fewest cores, then least memory, then least disk.
    #[default]
    Smallest,
    /// Most cores, then most memory, then most disk.
    Fastest,
}

/// Accumulates criteria and resolves them against a catalog snapshot.
#[derive(Clone, Debug)]
pub struct TemplateBuilder {
    catalog: Catalog,
    image_id: Option<ImageId>,
    os_family: Option<OsFamily>,
    image_name: Option<String>,
    architecture: Option<String>,
    size_id: Option<SizeId>,
    min_cores: Option<u32>,
    min_ram_mb: Option<u64>,
    size_preference: SizePreference,
    location_id: Option<LocationId>,
    options: TemplateOptions,
}

impl TemplateBuilder {
    /// Starts a builder with no criteria over `catalog`.
    #[must_use]
    pub fn new(catalog: Catalog) -> Self {
        Self {
            catalog,
            image_id: None,
            os_family: None,
            image_name: None,
            architecture: None,
            size_id: None,
            min_cores: None,
            min_ram_mb: None,
            size_preference: SizePreference::Smallest,
            location_id: None,
            options: TemplateOptions::new(),
        }
    }

    /// Requires a specific image.
    #[must_use]
    pub fn image_id(mut self, id: impl Into<ImageId>) -> Self {
        self.image_id = Some(id.into());
        self
    }

    /// Requires an operating system family.
    #[must_use]
    pub fn os_family(mut self, family: OsFamily) -> Self {
        self.os_family = Some(family);
        self
    }

    /// Requires the image name to contain `fragment`, ignoring case.
    #[must_use]
    pub fn image_name_matches(mut self, fragment: impl Into<String>) -> Self {
        self.image_name = Some(fragment.into());
        self
    }

    /// Requires an image architecture.
    #[must_use]
    pub fn architecture(mut self, architecture: impl Into<String>) -> Self {
        self.architecture = Some(architecture.into());
        self
    }

    /// Requires a specific size.
    #[must_use]
    pub fn size_id(mut self, id: impl Into<SizeId>) -> Self {
        self.size_id = Some(id.into());
        self
    }

    /// Requires at least `cores` virtual CPUs.
    #[must_use]
    pub fn min_cores(mut self, cores: u32) -> Self {
        self.min_cores = Some(cores);
        self
    }

    /// Requires at least `ram_mb` megabytes of memory.
    #[must_use]
    pub fn min_ram(mut self, ram_mb: u64) -> Self {
        self.min_ram_mb = Some(ram_mb);
        self
    }

    /// Picks the smallest matching size (the default).
    #[must_use]
    pub fn smallest(mut self) -> Self {
        self.size_preference = SizePreference::Smallest;
        self
    }

    /// Picks the largest matching size.
    #[must_use]
    pub fn fastest(mut self) -> Self {
        self.size_preference = SizePreference::Fastest;
        self
    }

    /// Requires a specific location.
    #[must_use]
    pub fn location_id(mut self, id: impl Into<LocationId>) -> Self {
        self.location_id = Some(id.into());
        self
    }

    /// Attaches bootstrap options to the resulting template.
    #[must_use]
    pub fn options(mut self, options: TemplateOptions) -> Self {
        self.options = options;
        self
    }

    /// Resolves the criteria into a template.
    ///
    /// # Errors
    ///
    /// Returns [`TemplateError::NoMatchingLocation`],
    /// [`TemplateError::NoMatchingImage`] or [`TemplateError::NoMatchingSize`]
    /// when the corresponding candidate set is empty.
    pub fn build(self) -> Result<Template, TemplateError> {
        let candidates = self.candidate_locations()?;
        let mut first_miss = None;
        for location in candidates {
            match self.resolve_image(location) {
                Ok(image) => {
                    let size = self.resolve_size(image)?.clone();
                    return Ok(Template {
                        image: image.clone(),
                        size,
                        location: location.clone(),
                        options: self.options,
                    });
                }
                Err(err) => {
                    first_miss.get_or_insert(err);
                }
            }
        }
        Err(first_miss.unwrap_or_else(|| TemplateError::NoMatchingLocation {
            criteria: String::from("default (catalog has no locations)"),
        }))
    }

    /// Locations to search for an image, most preferred first.
    ///
    /// A requested location is the only candidate. A requested image that
    /// the default location cannot see pins its own location. Otherwise
    /// every location is searched, starting with the default.
    fn candidate_locations(&self) -> Result<Vec<&Location>, TemplateError> {
        let registry = &self.catalog.locations;
        if let Some(id) = self.location_id.as_ref() {
            return registry
                .get(id)
                .map(|location| vec![location])
                .ok_or_else(|| TemplateError::NoMatchingLocation {
                    criteria: format!("id={id}"),
                });
        }

        let default = registry
            .default_location()
            .ok_or_else(|| TemplateError::NoMatchingLocation {
                criteria: String::from("default (catalog has no locations)"),
            })?;

        let requested_image = self
            .image_id
            .as_ref()
            .and_then(|id| self.catalog.images.iter().find(|image| &image.id == id));
        if let Some(image) = requested_image
            && !self.catalog.image_available_in(image, &default.id)
            && let Some(bound) = image.location.as_ref()
        {
            return registry
                .get(bound)
                .map(|location| vec![location])
                .ok_or_else(|| TemplateError::NoMatchingLocation {
                    criteria: format!("location {bound} of image {}", image.id),
                });
        }
        Ok(registry.search_order())
    }

    fn image_matches(&self, image: &Image, location: &Location) -> bool {
        self.image_id.as_ref().is_none_or(|id| &image.id == id)
            && self.os_family.is_none_or(|family| image.os_family == family)
            && self.image_name.as_ref().is_none_or(|fragment| {
                image
                    .name
                    .to_ascii_lowercase()
                    .contains(&fragment.to_ascii_lowercase())
            })
            && self
                .architecture
                .as_ref()
                .is_none_or(|arch| image.architecture.eq_ignore_ascii_case(arch))
            && self.catalog.image_available_in(image, &location.id)
    }

    fn resolve_image(&self, location: &Location) -> Result<&Image, TemplateError> {
        self.catalog
            .images
            .iter()
            .filter(|image| self.image_matches(image, location))
            .max_by(|left, right| {
                compare_versions(&left.version, &right.version)
                    .then_with(|| right.id.cmp(&left.id))
            })
            .ok_or_else(|| TemplateError::NoMatchingImage {
                criteria: self.describe_image_criteria(location),
            })
    }

    fn size_matches(&self, size: &Size, image: &Image) -> bool {
        size.supports(&image.architecture)
            && self.size_id.as_ref().is_none_or(|id| &size.id == id)
            && self.min_cores.is_none_or(|cores| size.cores >= cores)
            && self.min_ram_mb.is_none_or(|ram| size.ram_mb >= ram)
    }

    fn resolve_size(&self, image: &Image) -> Result<&Size, TemplateError> {
        let candidates = self
            .catalog
            .sizes
            .iter()
            .filter(|size| self.size_matches(size, image));
        let chosen = match self.size_preference {
            SizePreference::Smallest => candidates.min_by(|left, right| {
                left.capacity()
                    .cmp(&right.capacity())
                    .then_with(|| left.id.cmp(&right.id))
            }),
            SizePreference::Fastest => candidates.max_by(|left, right| {
                left.capacity()
                    .cmp(&right.capacity())
                    .then_with(|| right.id.cmp(&left.id))
            }),
        };
        chosen.ok_or_else(|| TemplateError::NoMatchingSize {
            criteria: self.describe_size_criteria(image),
        })
    }

    fn describe_image_criteria(&self, location: &Location) -> String {
        let mut parts = vec![format!("location={}", location.id)];
        if let Some(id) = self.image_id.as_ref() {
            parts.push(format!("id={id}"));
        }
        if let Some(family) = self.os_family {
            parts.push(format!("os={family}"));
        }
        if let Some(fragment) = self.image_name.as_ref() {
            parts.push(format!("name~{fragment}"));
        }
        if let Some(arch) = self.architecture.as_ref() {
            parts.push(format!("arch={arch}"));
        }
        parts.join(", ")
    }

    fn describe_size_criteria(&self, image: &Image) -> String {
        let mut parts = vec![format!("arch={}", image.architecture)];
        if let Some(id) = self.size_id.as_ref() {
            parts.push(format!("id={id}"));
        }
        if let Some(cores) = self.min_cores {
            parts.push(format!("cores>={cores}"));
        }
        if let Some(ram) = self.min_ram_mb {
            parts.push(format!("ram>={ram}MB"));
        }
        parts.join(", ")
    }
}
