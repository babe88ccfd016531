//! Scaleway Instances adapter.
//!
//! Server creation, power actions and image listing go through `scaleway-rs`.
//! Server reads and the product catalogue use direct HTTP calls because the
//! SDK does not expose tag filtering or commercial types.
//!
//! The adapter manages a single availability zone. Batches are recorded as a
//! `cumulus-tag=<tag>` server tag, so any client holding the same API key
//! sees the same nodes.

mod error;
mod types;

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, LazyLock, Mutex, PoisonError};
use std::time::Duration;

use scaleway_rs::{ScalewayApi, ScalewayCreateInstanceBuilder, ScalewayListInstanceImagesBuilder};
use serde::de::DeserializeOwned;
use tracing::debug;
use uuid::Uuid;

use crate::backend::{BackendFuture, ComputeBackend};
use crate::config::ScalewayConfig;
use crate::location::Location;
use crate::node::{Credentials, NodeMetadata, NodeState};
use crate::template::{Image, Size, Template};
use crate::types::{ImageId, LocationId, NodeId};

pub use error::ScalewayBackendError;
use types::{ProductList, Server, ServerEnvelope, ServerList};

const SCALEWAY_INSTANCE_API_BASE: &str = "https://api.scaleway.com/instance/v1";
const HTTP_TIMEOUT: Duration = Duration::from_secs(30);
const PAGE_SIZE: usize = 100;
const LOGIN_ACCOUNT: &str = "root";

static HTTP_CLIENT: LazyLock<reqwest::Client> = LazyLock::new(|| {
    reqwest::Client::builder()
        .timeout(HTTP_TIMEOUT)
        .build()
        .unwrap_or_else(|_| reqwest::Client::new())
});

/// Backend that provisions nodes through the Scaleway Instances API.
#[derive(Clone)]
pub struct ScalewayBackend {
    api: ScalewayApi,
    config: ScalewayConfig,
    logins: Arc<Mutex<BTreeMap<NodeId, Credentials>>>,
}

impl ScalewayBackend {
    /// Constructs a new backend from configuration.
    ///
    /// # Errors
    ///
    /// Returns [`ScalewayBackendError::Config`] when the provided configuration
    /// fails validation.
    pub fn new(config: ScalewayConfig) -> Result<Self, ScalewayBackendError> {
        config.validate()?;
        Ok(Self {
            api: ScalewayApi::new(&config.secret_key),
            config,
            logins: Arc::default(),
        })
    }

    /// Zone every node is placed in.
    #[must_use]
    pub fn zone(&self) -> &str {
        &self.config.default_zone
    }

    fn login_for(&self, id: &NodeId) -> Option<Credentials> {
        self.logins
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .cloned()
    }

    fn remember_login(&self, id: &NodeId, credentials: Option<&Credentials>) {
        let mut logins = self.logins.lock().unwrap_or_else(PoisonError::into_inner);
        match credentials {
            Some(login) => logins.insert(id.clone(), login.clone()),
            None => logins.remove(id),
        };
    }

    fn to_node(&self, server: Server) -> Option<NodeMetadata> {
        let credentials = self.login_for(&NodeId::from(server.id.as_str()));
        server.into_node(credentials)
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, String)],
        resource: &'static str,
    ) -> Result<T, ScalewayBackendError> {
        let url = format!(
            "{SCALEWAY_INSTANCE_API_BASE}/zones/{}/{path}",
            self.config.default_zone
        );
        let response = HTTP_CLIENT
            .get(&url)
            .header("X-Auth-Token", &self.config.secret_key)
            .query(query)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ScalewayBackendError::from_status(
                "GET",
                path.to_owned(),
                status.as_u16(),
                body,
            ));
        }
        response
            .json::<T>()
            .await
            .map_err(|err| ScalewayBackendError::Decode {
                resource,
                message: err.to_string(),
            })
    }

    async fn fetch_server(&self, id: &NodeId) -> Result<Server, ScalewayBackendError> {
        let envelope: ServerEnvelope = self
            .get_json(&format!("servers/{id}"), &[], "server")
            .await?;
        Ok(envelope.server)
    }

    async fn fetch_servers(&self, tag: Option<&str>) -> Result<Vec<Server>, ScalewayBackendError> {
        let mut servers = Vec::new();
        for page in 1.. {
            let mut query = vec![
                ("per_page", PAGE_SIZE.to_string()),
                ("page", page.to_string()),
            ];
            if let Some(batch) = tag {
                query.push(("tags", types::tag_label(batch)));
            }
            let listed: ServerList = self.get_json("servers", &query, "server list").await?;
            let fetched = listed.servers.len();
            servers.extend(listed.servers);
            if fetched < PAGE_SIZE {
                break;
            }
        }
        Ok(servers)
    }

    async fn power_on(
        &self,
        id: &str,
        state: &str,
        allowed: &[String],
    ) -> Result<(), ScalewayBackendError> {
        if state == "running" || state == "starting" {
            return Ok(());
        }
        if allowed.iter().any(|action| action == "poweron") {
            self.api
                .perform_instance_action_async(self.zone(), id, "poweron")
                .await?;
            return Ok(());
        }
        Err(ScalewayBackendError::PowerOnNotAllowed {
            id: id.to_owned(),
            state: state.to_owned(),
        })
    }

    fn server_tags(tag: &str, template: &Template) -> Vec<String> {
        let mut tags = vec![types::tag_label(tag)];
        tags.extend(template.options.public_key().map(types::authorized_key_tag));
        tags.extend(
            template
                .descriptive_metadata()
                .iter()
                .map(|(key, value)| types::metadata_tag(key, value)),
        );
        tags
    }

    async fn create(
        &self,
        tag: &str,
        template: &Template,
    ) -> Result<NodeMetadata, ScalewayBackendError> {
        let name = format!("{tag}-{}", Uuid::new_v4().simple());
        let server = ScalewayCreateInstanceBuilder::new(
            self.api.clone(),
            self.zone(),
            &name,
            template.size.id.as_str(),
        )
        .image(template.image.id.as_str())
        .project(&self.config.default_project_id)
        .routed_ip_enabled(true)
        .tags(Self::server_tags(tag, template))
        .run_async()
        .await?;

        self.power_on(&server.id, &server.state, &server.allowed_actions)
            .await?;

        let id = NodeId::from(server.id.as_str());
        let credentials = template
            .options
            .private_key()
            .map(|key| Credentials::new(LOGIN_ACCOUNT, key));
        self.remember_login(&id, credentials.as_ref());
        debug!(node = %id, %tag, zone = self.zone(), "scaleway server created");

        Ok(NodeMetadata {
            id,
            tag: tag.to_owned(),
            name,
            state: NodeState::Pending,
            image: template.image.id.clone(),
            location: LocationId::from(self.zone()),
            public_addresses: server
                .public_ip
                .iter()
                .filter_map(|ip| ip.address.parse().ok())
                .collect(),
            private_addresses: BTreeSet::new(),
            credentials,
            user_metadata: template.descriptive_metadata(),
        })
    }

    async fn images(&self) -> Result<Vec<Image>, ScalewayBackendError> {
        let zone = self.zone();
        let arch = &self.config.default_architecture;
        let public = ScalewayListInstanceImagesBuilder::new(self.api.clone(), zone)
            .public(true)
            .arch(arch)
            .run_async()
            .await?;
        let mut by_id: BTreeMap<ImageId, Image> = public
            .into_iter()
            .filter_map(|image| types::image_from(image, zone))
            .map(|image| (image.id.clone(), image))
            .collect();
        let project = &self.config.default_project_id;
        let mut scoped = ScalewayListInstanceImagesBuilder::new(self.api.clone(), zone)
            .public(false)
            .project(project)
            .arch(arch);
        if let Some(org) = &self.config.default_organization_id {
            scoped = scoped.organization(org);
        }
        by_id.extend(
            scoped
                .run_async()
                .await?
                .into_iter()
                .filter_map(|image| types::image_from(image, zone))
                .map(|image| (image.id.clone(), image)),
        );
        Ok(by_id.into_values().collect())
    }

    async fn sizes(&self) -> Result<Vec<Size>, ScalewayBackendError> {
        let products: ProductList = self
            .get_json("products/servers", &[], "server products")
            .await?;
        Ok(products
            .servers
            .into_iter()
            .map(|(commercial_type, product)| types::size_from(commercial_type, &product))
            .collect())
    }

    async fn destroy(&self, id: &NodeId) -> Result<(), ScalewayBackendError> {
        let server = self.fetch_server(id).await?;
        if server.batch_tag().is_none() {
            return Err(ScalewayBackendError::NotManaged { id: server.id });
        }
        let action = if server.allowed_actions.iter().any(|allowed| allowed == "terminate") {
            self.api
                .perform_instance_action_async(self.zone(), id.as_str(), "terminate")
                .await?;
            "terminate"
        } else {
            self.api.delete_instance_async(self.zone(), id.as_str()).await?;
            "delete"
        };
        self.remember_login(id, None);
        debug!(node = %id, action, "scaleway server destroyed");
        Ok(())
    }
}

impl ComputeBackend for ScalewayBackend {
    type Error = ScalewayBackendError;

    fn provider_name(&self) -> &str {
        types::PROVIDER_ID
    }

    fn default_login_account(&self) -> Option<&str> {
        Some(LOGIN_ACCOUNT)
    }

    fn create_node<'a>(
        &'a self,
        tag: &'a str,
        template: &'a Template,
    ) -> BackendFuture<'a, NodeMetadata, Self::Error> {
        Box::pin(self.create(tag, template))
    }

    fn list_nodes<'a>(
        &'a self,
        tag: Option<&'a str>,
    ) -> BackendFuture<'a, Vec<NodeMetadata>, Self::Error> {
        Box::pin(async move {
            let servers = self.fetch_servers(tag).await?;
            Ok(servers
                .into_iter()
                .filter_map(|server| self.to_node(server))
                .filter(|node| tag.is_none_or(|batch| node.tag == batch))
                .collect())
        })
    }

    fn get_node<'a>(&'a self, id: &'a NodeId) -> BackendFuture<'a, NodeMetadata, Self::Error> {
        Box::pin(async move {
            let server = self.fetch_server(id).await?;
            self.to_node(server)
                .ok_or_else(|| ScalewayBackendError::NotManaged { id: id.to_string() })
        })
    }

    fn reboot_node<'a>(&'a self, id: &'a NodeId) -> BackendFuture<'a, (), Self::Error> {
        Box::pin(async move {
            self.api
                .perform_instance_action_async(self.zone(), id.as_str(), "reboot")
                .await?;
            Ok(())
        })
    }

    fn destroy_node<'a>(&'a self, id: &'a NodeId) -> BackendFuture<'a, (), Self::Error> {
        Box::pin(self.destroy(id))
    }

    fn list_images(&self) -> BackendFuture<'_, Vec<Image>, Self::Error> {
        Box::pin(self.images())
    }

    fn list_sizes(&self) -> BackendFuture<'_, Vec<Size>, Self::Error> {
        Box::pin(self.sizes())
    }

    fn list_assignable_locations(&self) -> BackendFuture<'_, Vec<Location>, Self::Error> {
        Box::pin(async move { Ok(types::locations_for([self.zone()])) })
    }
}
