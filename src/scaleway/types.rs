//! Instances API payloads and their mapping onto compute types.

use std::collections::{BTreeMap, BTreeSet};
use std::net::IpAddr;

use scaleway_rs::ScalewayImage;
use serde::Deserialize;

use crate::location::{Location, LocationScope};
use crate::node::{Credentials, NodeMetadata, NodeState};
use crate::template::{Image, OsFamily, Size};
use crate::types::{ImageId, LocationId, NodeId, SizeId};

pub(super) const PROVIDER_ID: &str = "scaleway";
const TAG_PREFIX: &str = "cumulus-tag=";
const AUTHORIZED_KEY_PREFIX: &str = "AUTHORIZED_KEY=";
const METADATA_PREFIX: &str = "cumulus-meta:";
const BYTES_PER_MB: u64 = 1 << 20;
const BYTES_PER_GB: u64 = 1_000_000_000;

#[derive(Debug, Deserialize)]
pub(super) struct ServerList {
    #[serde(default)]
    pub(super) servers: Vec<Server>,
}

#[derive(Debug, Deserialize)]
pub(super) struct ServerEnvelope {
    pub(super) server: Server,
}

#[derive(Clone, Debug, Deserialize)]
pub(super) struct Server {
    pub(super) id: String,
    #[serde(default)]
    pub(super) name: String,
    pub(super) state: String,
    #[serde(default)]
    pub(super) allowed_actions: Vec<String>,
    #[serde(default)]
    pub(super) tags: Vec<String>,
    #[serde(default)]
    pub(super) image: Option<ServerImage>,
    #[serde(default)]
    pub(super) public_ip: Option<ServerIp>,
    #[serde(default)]
    pub(super) public_ips: Vec<ServerIp>,
    #[serde(default)]
    pub(super) private_ip: Option<String>,
    pub(super) zone: String,
}

#[derive(Clone, Debug, Deserialize)]
pub(super) struct ServerImage {
    pub(super) id: String,
}

#[derive(Clone, Debug, Deserialize)]
pub(super) struct ServerIp {
    pub(super) address: String,
}

#[derive(Debug, Deserialize)]
pub(super) struct ProductList {
    #[serde(default)]
    pub(super) servers: BTreeMap<String, Product>,
}

#[derive(Debug, Deserialize)]
pub(super) struct Product {
    pub(super) ncpus: u32,
    pub(super) ram: u64,
    #[serde(default)]
    pub(super) arch: Option<String>,
    #[serde(default)]
    pub(super) volumes_constraint: Option<VolumeConstraint>,
}

#[derive(Debug, Deserialize)]
pub(super) struct VolumeConstraint {
    #[serde(default)]
    pub(super) max_size: u64,
}

/// Server tag recording the batch a node belongs to.
pub(super) fn tag_label(tag: &str) -> String {
    format!("{TAG_PREFIX}{tag}")
}

/// Server tag the Scaleway image agent turns into an `authorized_keys` entry.
///
/// Tags cannot carry spaces, so they are replaced with underscores.
pub(super) fn authorized_key_tag(public_key: &str) -> String {
    format!("{AUTHORIZED_KEY_PREFIX}{}", public_key.trim().replace(' ', "_"))
}

/// Server tag carrying one descriptive metadata entry.
pub(super) fn metadata_tag(key: &str, value: &str) -> String {
    format!("{METADATA_PREFIX}{key}={value}")
}

fn user_metadata(tags: &[String]) -> BTreeMap<String, String> {
    tags.iter()
        .filter_map(|label| label.strip_prefix(METADATA_PREFIX))
        .filter_map(|entry| entry.split_once('='))
        .map(|(key, value)| (key.to_owned(), value.to_owned()))
        .collect()
}

fn batch_tag(tags: &[String]) -> Option<&str> {
    tags.iter().find_map(|label| label.strip_prefix(TAG_PREFIX))
}

/// Maps a Scaleway server state onto the lifecycle.
///
/// A freshly created server is `stopped` until the adapter powers it on, so
/// the stopped states count as pending.
pub(super) fn node_state(raw: &str) -> NodeState {
    match raw {
        "stopped" | "stopped in place" | "stopping" => NodeState::Pending,
        other => NodeState::from_provider(other),
    }
}

/// Region owning a zone: `fr-par-1` belongs to `fr-par`.
pub(super) fn region_of(zone: &str) -> &str {
    match zone.rsplit_once('-') {
        Some((region, index)) if !region.is_empty() && index.bytes().all(|b| b.is_ascii_digit()) => {
            region
        }
        _ => zone,
    }
}

/// Provider, region and zone locations covering `zones`.
pub(super) fn locations_for<'a>(zones: impl IntoIterator<Item = &'a str>) -> Vec<Location> {
    let provider = Location::provider(PROVIDER_ID, "Scaleway");
    let mut regions = BTreeMap::new();
    let mut zone_locations = Vec::new();
    for zone in zones {
        let region = regions
            .entry(region_of(zone).to_owned())
            .or_insert_with_key(|id| {
                Location::child_of(&provider, id.as_str(), LocationScope::Region, id.as_str())
            });
        zone_locations.push(Location::child_of(region, zone, LocationScope::Zone, zone));
    }
    let mut locations = vec![provider];
    locations.extend(regions.into_values());
    locations.extend(zone_locations);
    locations
}

/// Version of an image: the first token of its name that starts with a
/// digit, else its creation date.
pub(super) fn image_version(name: &str, creation_date: &str) -> String {
    name.split_whitespace()
        .find(|token| token.starts_with(|c: char| c.is_ascii_digit()))
        .unwrap_or(creation_date)
        .to_owned()
}

/// Converts an available image; other states are skipped.
pub(super) fn image_from(image: ScalewayImage, zone: &str) -> Option<Image> {
    if image.state != "available" {
        return None;
    }
    let version = image_version(&image.name, &image.creation_date);
    Some(Image {
        id: ImageId::from(image.id),
        os_family: OsFamily::detect(&image.name),
        os_description: image.name.clone(),
        name: image.name,
        architecture: image.arch,
        version,
        location: Some(LocationId::from(zone)),
    })
}

pub(super) fn size_from(commercial_type: String, product: &Product) -> Size {
    let disk_bytes = product
        .volumes_constraint
        .as_ref()
        .map_or(0, |constraint| constraint.max_size);
    Size {
        id: SizeId::from(commercial_type),
        cores: product.ncpus,
        ram_mb: product.ram.checked_div(BYTES_PER_MB).unwrap_or(0),
        disk_gb: disk_bytes.checked_div(BYTES_PER_GB).unwrap_or(0),
        supported_architectures: product.arch.iter().cloned().collect(),
    }
}

fn parse_addresses<'a>(raw: impl IntoIterator<Item = &'a str>) -> BTreeSet<IpAddr> {
    raw.into_iter()
        .filter_map(|address| address.parse().ok())
        .collect()
}

impl Server {
    /// Batch tag carried by the server, if it was created by this crate.
    pub(super) fn batch_tag(&self) -> Option<&str> {
        batch_tag(&self.tags)
    }

    /// Converts the server; servers without a batch tag are not ours.
    pub(super) fn into_node(self, credentials: Option<Credentials>) -> Option<NodeMetadata> {
        let tag = self.batch_tag()?.to_owned();
        let public_addresses = parse_addresses(
            self.public_ip
                .iter()
                .chain(self.public_ips.iter())
                .map(|ip| ip.address.as_str()),
        );
        let private_addresses = parse_addresses(self.private_ip.as_deref());
        let user_metadata = user_metadata(&self.tags);
        Some(NodeMetadata {
            id: NodeId::from(self.id),
            tag,
            name: self.name,
            state: node_state(&self.state),
            image: ImageId::from(self.image.map(|image| image.id).unwrap_or_default()),
            location: LocationId::from(self.zone),
            public_addresses,
            private_addresses,
            credentials,
            user_metadata,
        })
    }
}
