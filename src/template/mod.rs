//! Templates: the image, size and location a node is provisioned from.
//!
//! A [`Template`] is resolved from a [`Catalog`] snapshot by the
//! [`TemplateBuilder`]. Resolution is deterministic, so the same criteria
//! against the same catalog always yield equal templates.

mod builder;
mod options;

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;

use thiserror::Error;

use crate::location::{Location, LocationRegistry};
use crate::types::{ImageId, LocationId, SizeId};

pub use builder::{SizePreference, TemplateBuilder};
pub use options::{PortWait, TemplateOptions};

/// Operating system family of an image.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum OsFamily {
    /// Ubuntu Linux.
    Ubuntu,
    /// Debian GNU/Linux.
    Debian,
    /// `CentOS` Linux.
    Centos,
    /// Red Hat Enterprise Linux.
    Rhel,
    /// Microsoft Windows.
    Windows,
    /// Anything that could not be classified.
    Unrecognized,
}

impl OsFamily {
    /// Guesses the family from an image name or description.
    #[must_use]
    pub fn detect(name: &str) -> Self {
        let lowered = name.to_ascii_lowercase();
        if lowered.contains("ubuntu") {
            Self::Ubuntu
        } else if lowered.contains("debian") {
            Self::Debian
        } else if lowered.contains("centos") {
            Self::Centos
        } else if lowered.contains("rhel") || lowered.contains("red hat") {
            Self::Rhel
        } else if lowered.contains("windows") {
            Self::Windows
        } else {
            Self::Unrecognized
        }
    }

    /// Lower-case name of the family.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Ubuntu => "ubuntu",
            Self::Debian => "debian",
            Self::Centos => "centos",
            Self::Rhel => "rhel",
            Self::Windows => "windows",
            Self::Unrecognized => "unrecognized",
        }
    }
}

impl fmt::Display for OsFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A bootable image offered by the provider.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct Image {
    /// Provider image identifier.
    pub id: ImageId,
    /// Display name.
    pub name: String,
    /// Operating system family.
    pub os_family: OsFamily,
    /// Free-form operating system description.
    pub os_description: String,
    /// CPU architecture, for example `x86_64`.
    pub architecture: String,
    /// Image version; dotted numeric segments compare numerically.
    pub version: String,
    /// Location the image is bound to; `None` when it is usable everywhere.
    pub location: Option<LocationId>,
}

/// A hardware profile offered by the provider.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct Size {
    /// Provider size identifier.
    pub id: SizeId,
    /// Virtual CPU count.
    pub cores: u32,
    /// Memory in megabytes.
    pub ram_mb: u64,
    /// Root disk in gigabytes.
    pub disk_gb: u64,
    /// Architectures the size can run; empty means any.
    pub supported_architectures: Vec<String>,
}

impl Size {
    /// Returns `true` when images built for `architecture` can run here.
    #[must_use]
    pub fn supports(&self, architecture: &str) -> bool {
        self.supported_architectures.is_empty()
            || self
                .supported_architectures
                .iter()
                .any(|supported| supported.eq_ignore_ascii_case(architecture))
    }

    fn capacity(&self) -> (u32, u64, u64) {
        (self.cores, self.ram_mb, self.disk_gb)
    }
}

/// A resolved provisioning request.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Template {
    /// Image to boot.
    pub image: Image,
    /// Hardware profile.
    pub size: Size,
    /// Placement.
    pub location: Location,
    /// Bootstrap and readiness options.
    pub options: TemplateOptions,
}

impl Template {
    /// Returns a copy carrying `options` in place of the current ones.
    #[must_use]
    pub fn with_options(mut self, options: TemplateOptions) -> Self {
        self.options = options;
        self
    }

    /// Key/value pairs describing what a node was built from.
    ///
    /// Empty unless the options ask for metadata.
    #[must_use]
    pub fn descriptive_metadata(&self) -> BTreeMap<String, String> {
        if !self.options.includes_metadata() {
            return BTreeMap::new();
        }
        [
            ("image", self.image.id.as_str()),
            ("size", self.size.id.as_str()),
            ("location", self.location.id.as_str()),
            ("os", self.image.os_family.as_str()),
        ]
        .into_iter()
        .map(|(key, value)| (key.to_owned(), value.to_owned()))
        .collect()
    }
}

/// Snapshot of what a provider offers.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Catalog {
    /// Bootable images.
    pub images: Vec<Image>,
    /// Hardware profiles.
    pub sizes: Vec<Size>,
    /// Assignable locations.
    pub locations: LocationRegistry,
}

impl Catalog {
    /// Returns `true` when `image` can be booted in `location`.
    ///
    /// Location-free images are available everywhere; otherwise `location`
    /// must be the image location or one of its descendants.
    #[must_use]
    pub fn image_available_in(&self, image: &Image, location: &LocationId) -> bool {
        image.location.as_ref().is_none_or(|bound| {
            self.locations
                .is_same_or_child(location, bound)
                .unwrap_or(false)
        })
    }

    /// Starts a template builder over this catalog.
    #[must_use]
    pub fn template_builder(&self) -> TemplateBuilder {
        TemplateBuilder::new(self.clone())
    }
}

/// Errors raised while resolving a template.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum TemplateError {
    /// Raised when no image satisfies the criteria.
    #[error("no image matches {criteria}")]
    NoMatchingImage {
        /// Rendering of the image criteria.
        criteria: String,
    },
    /// Raised when no size satisfies the criteria.
    #[error("no size matches {criteria}")]
    NoMatchingSize {
        /// Rendering of the size criteria.
        criteria: String,
    },
    /// Raised when the requested or default location cannot be resolved.
    #[error("no location matches {criteria}")]
    NoMatchingLocation {
        /// Rendering of the location criteria.
        criteria: String,
    },
}

/// Compares image versions, treating numeric segments as numbers.
#[must_use]
pub fn compare_versions(left: &str, right: &str) -> Ordering {
    let split = |value: &str| -> Vec<String> {
        value
            .split(['.', '-', '_'])
            .map(str::to_owned)
            .collect()
    };
    let left_parts = split(left);
    let right_parts = split(right);
    for (a, b) in left_parts.iter().zip(right_parts.iter()) {
        let ordering = match (a.parse::<u64>(), b.parse::<u64>()) {
            (Ok(x), Ok(y)) => x.cmp(&y),
            _ => a.cmp(b),
        };
        if ordering != Ordering::Equal {
            return ordering;
        }
    }
    left_parts.len().cmp(&right_parts.len())
}

/// Bootstrap script that installs `curl` and the CA bundle on the given
/// family.
///
/// Returns `None` for families without a known package manager recipe.
#[must_use]
pub fn bootstrap_script(os_family: OsFamily) -> Option<String> {
    let lines: &[&str] = match os_family {
        OsFamily::Ubuntu | OsFamily::Debian => &[
            "export DEBIAN_FRONTEND=noninteractive",
            "apt-get update -qq",
            "apt-get install -y curl ca-certificates",
        ],
        OsFamily::Centos | OsFamily::Rhel => &["yum -y install curl ca-certificates"],
        OsFamily::Windows | OsFamily::Unrecognized => return None,
    };
    let mut script = String::from("#!/bin/sh\nset -e\n");
    for line in lines {
        script.push_str(line);
        script.push('\n');
    }
    Some(script)
}
