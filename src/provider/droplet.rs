//! Droplet provisioning on the provider.
//!
//! Actions that change a droplet's state answer with an `event_id`; those are handed to
//! the `OperationTracker` and finish only once the event is done (or assumed done).
//! Instances created or changed here are written back to the inventory.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

use crate::error::{NimbusError, Result};
use crate::instance::{Instance, Inventory, DEFAULT_PORT, DEFAULT_SSH_KEY};
use crate::paths::resolve_under;
use crate::progress;
use crate::provider::client::{take, ProviderClient};
use crate::provider::operation::{OperationTracker, ProgressHandle, TrackOutcome};

pub const DEFAULT_SIZE: &str = "512mb";
pub const DEFAULT_IMAGE: &str = "ubuntu-14-04-x64";
pub const DEFAULT_REGION: &str = "nyc2";

/// Time given to a droplet to come up after it was started.
pub const BOOT_WAIT: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SshKey {
    pub id: u64,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Image {
    pub id: u64,
    pub name: String,
    #[serde(default)]
    pub slug: Option<String>,
    #[serde(default)]
    pub distribution: Option<String>,
}

/// A size or a region.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resource {
    pub id: u64,
    pub name: String,
    #[serde(default)]
    pub slug: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Droplet {
    pub id: u64,
    pub name: String,
    #[serde(default)]
    pub ip_address: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    /// Every other field of the provider's record.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Deserialize)]
struct Created {
    id: u64,
    event_id: u64,
}

/// Size or region selector.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResourceRef {
    Id(u64),
    Slug(String),
}

impl ResourceRef {
    fn query(&self, kind: &'static str) -> (String, String) {
        match self {
            ResourceRef::Id(id) => (format!("{}_id", kind), id.to_string()),
            ResourceRef::Slug(slug) => (format!("{}_slug", kind), slug.clone()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImageRef {
    Id(u64),
    Slug(String),
    Name(String),
}

#[derive(Debug, Clone)]
pub struct CreateOptions {
    pub name: String,
    pub cluster: String,
    /// Public key uploaded to the provider. Relative paths are under the config directory.
    pub ssh_pub_key: String,
    /// Private key recorded on the new instance.
    pub ssh_key: Option<String>,
    pub ssh_port: Option<u16>,
    pub size: Option<ResourceRef>,
    pub image: Option<ImageRef>,
    pub region: Option<ResourceRef>,
    pub backups_enabled: bool,
    pub private_networking: bool,
}

impl CreateOptions {
    pub fn new(name: impl Into<String>, cluster: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            cluster: cluster.into(),
            ssh_pub_key: format!("{}.pub", DEFAULT_SSH_KEY),
            ssh_key: None,
            ssh_port: None,
            size: None,
            image: None,
            region: None,
            backups_enabled: false,
            private_networking: false,
        }
    }
}

/// Name under which a public key is registered with the provider.
///
/// Derived from the key contents, so the same key is only ever uploaded once.
pub fn hashed_key_name(key_data: &str) -> String {
    let digest = format!("{:x}", Sha256::digest(key_data.trim().as_bytes()));
    format!("nimbus-{}", &digest[..12])
}

pub struct Provisioner {
    client: Arc<dyn ProviderClient>,
    tracker: OperationTracker,
    boot_wait: Duration,
    show_progress: bool,
}

impl Provisioner {
    pub fn new(client: Arc<dyn ProviderClient>) -> Self {
        Self {
            tracker: OperationTracker::new(Arc::clone(&client)),
            client,
            boot_wait: BOOT_WAIT,
            show_progress: true,
        }
    }

    pub fn with_tracker(mut self, tracker: OperationTracker) -> Self {
        self.tracker = tracker;
        self
    }

    pub fn with_boot_wait(mut self, boot_wait: Duration) -> Self {
        self.boot_wait = boot_wait;
        self
    }

    /// Disables the progress bar and boot spinner.
    pub fn quiet(mut self) -> Self {
        self.show_progress = false;
        self
    }

    async fn get<T: serde::de::DeserializeOwned>(
        &self,
        endpoint: &str,
        query: &[(&str, String)],
        key: &str,
    ) -> Result<T> {
        let mut body = self.client.request(endpoint, query).await?;
        take(&mut body, key)
    }

    pub async fn keys(&self) -> Result<Vec<SshKey>> {
        self.get("ssh_keys", &[], "ssh_keys").await
    }

    pub async fn images(&self) -> Result<Vec<Image>> {
        self.get("images", &[], "images").await
    }

    /// Images owned by the account.
    pub async fn snapshots(&self) -> Result<Vec<Image>> {
        self.get("images", &[("filter", "my_images".to_string())], "images")
            .await
    }

    pub async fn sizes(&self) -> Result<Vec<Resource>> {
        self.get("sizes", &[], "sizes").await
    }

    pub async fn regions(&self) -> Result<Vec<Resource>> {
        self.get("regions", &[], "regions").await
    }

    pub async fn droplets(&self) -> Result<Vec<Droplet>> {
        self.get("droplets", &[], "droplets").await
    }

    pub async fn droplet(&self, id: u64) -> Result<Droplet> {
        self.get(&format!("droplets/{}", id), &[], "droplet").await
    }

    /// Returns the id of the uploaded copy of the public key at `path`, uploading it
    /// first if the provider doesn't have it yet.
    pub async fn find_or_create_key(&self, path: &Path) -> Result<u64> {
        let key_data = tokio::fs::read_to_string(path).await?;
        let name = hashed_key_name(&key_data);

        if let Some(key) = self.keys().await?.into_iter().find(|key| key.name == name) {
            progress::status(&format!("Using SSH key: {}", path.display()));
            return Ok(key.id);
        }
        progress::status(&format!("Uploading new SSH key: {}", path.display()));
        let key: SshKey = self
            .get(
                "ssh_keys/new",
                &[("name", name), ("ssh_pub_key", key_data)],
                "ssh_key",
            )
            .await?;
        Ok(key.id)
    }

    async fn find_image(&self, image: &ImageRef) -> Result<Image> {
        let images = self.images().await?;
        let found = images.into_iter().find(|candidate| match image {
            ImageRef::Id(id) => candidate.id == *id,
            ImageRef::Slug(slug) => candidate.slug.as_deref() == Some(slug.as_str()),
            ImageRef::Name(name) => candidate.name == *name,
        });
        found.ok_or_else(|| {
            let described = match image {
                ImageRef::Id(id) => format!("id \"{}\"", id),
                ImageRef::Slug(slug) => format!("slug \"{}\"", slug),
                ImageRef::Name(name) => format!("name \"{}\"", name),
            };
            NimbusError::Config(format!(
                "Image with {} not found, no action taken.",
                described
            ))
        })
    }

    /// Waits for an event, drawing a progress bar if enabled.
    pub async fn wait_for_event(&self, event_id: u64) -> Result<TrackOutcome> {
        let handle = ProgressHandle::new();
        let bar = self.show_progress.then(|| progress::follow(handle.clone()));
        let outcome = self.tracker.track_with(event_id, &handle).await;
        if let Some(bar) = bar {
            bar.await.ok();
        }
        outcome
    }

    /// Issues a request that answers with an `event_id` and waits for the event.
    async fn evented(&self, endpoint: &str, query: &[(&str, String)]) -> Result<TrackOutcome> {
        let mut body = self.client.request(endpoint, query).await?;
        let event_id: u64 = take(&mut body, "event_id")?;
        log::debug!("{} started event {}", endpoint, event_id);
        self.wait_for_event(event_id).await
    }

    pub async fn wait_for_boot(&self, name: &str) {
        if self.boot_wait.is_zero() {
            return;
        }
        let message = format!("Waiting for \"{}\" to boot...", name);
        let spinner = self.show_progress.then(|| progress::spinner(&message));
        tokio::time::sleep(self.boot_wait).await;
        if let Some(spinner) = spinner {
            spinner.finish_and_clear();
        }
    }

    /// Creates a droplet, waits for it to boot and saves it to the inventory.
    pub async fn create(
        &self,
        options: &CreateOptions,
        inventory: &mut Inventory,
        config_dir: &Path,
    ) -> Result<Instance> {
        let image = match &options.image {
            Some(ImageRef::Name(name)) => Some(ResourceRef::Id(
                self.find_image(&ImageRef::Name(name.clone())).await?.id,
            )),
            Some(ImageRef::Id(id)) => Some(ResourceRef::Id(*id)),
            Some(ImageRef::Slug(slug)) => Some(ResourceRef::Slug(slug.clone())),
            None => None,
        };

        let pub_key = resolve_under(config_dir, &options.ssh_pub_key);
        let key_id = self.find_or_create_key(&pub_key).await?;

        let mut query: Vec<(String, String)> = vec![
            ("name".into(), options.name.clone()),
            ("backups_enabled".into(), options.backups_enabled.to_string()),
            ("private_networking".into(), options.private_networking.to_string()),
            ("ssh_key_ids".into(), key_id.to_string()),
        ];
        let selectors = [
            ("size", options.size.clone(), DEFAULT_SIZE),
            ("image", image, DEFAULT_IMAGE),
            ("region", options.region.clone(), DEFAULT_REGION),
        ];
        for (kind, selector, default) in selectors {
            let selector = selector.unwrap_or_else(|| ResourceRef::Slug(default.to_string()));
            query.push(selector.query(kind));
        }
        let query: Vec<(&str, String)> = query
            .iter()
            .map(|(key, value)| (key.as_str(), value.clone()))
            .collect();

        let created: Created = self.get("droplets/new", &query, "droplet").await?;
        progress::status(&format!(
            "Creating droplet {} on DigitalOcean, please wait...",
            created.id
        ));
        self.wait_for_event(created.event_id).await?;
        progress::success("Droplet created!");
        self.wait_for_boot(&options.name).await;

        let droplet = self.droplet(created.id).await?;
        let mut instance = Instance::new(
            droplet.name.clone(),
            droplet.ip_address.clone().unwrap_or_default(),
        );
        instance.ssh_key = options
            .ssh_key
            .clone()
            .unwrap_or_else(|| DEFAULT_SSH_KEY.to_string());
        instance.port = options.ssh_port.unwrap_or(DEFAULT_PORT);
        instance.provider = Some(serde_json::to_value(&droplet)?);

        inventory.add_instance(&options.cluster, instance.clone());
        inventory.save()?;
        progress::success(&format!(
            "Instance \"{}\" ({}) saved.",
            instance.name, instance.address
        ));
        Ok(instance)
    }

    /// Droplet id of `instance`, looked up by name if the inventory doesn't know it.
    pub async fn droplet_id(&self, instance: &Instance, inventory: &mut Inventory) -> Result<u64> {
        if let Some(id) = instance.provider_id() {
            return Ok(id);
        }
        let droplet = self
            .droplets()
            .await?
            .into_iter()
            .find(|droplet| droplet.name == instance.name)
            .ok_or_else(|| {
                NimbusError::Provider(format!(
                    "No droplet with name \"{}\" found. Please check your instance names in your DigitalOcean account.",
                    instance.name
                ))
            })?;
        let id = droplet.id;
        record(inventory, droplet)?;
        Ok(id)
    }

    /// Fetches the droplet and stores its address and record on the instance.
    pub async fn refresh(&self, id: u64, inventory: &mut Inventory) -> Result<Droplet> {
        let droplet = self.droplet(id).await?;
        record(inventory, droplet.clone())?;
        Ok(droplet)
    }

    pub async fn power_on(&self, instance: &Instance, inventory: &mut Inventory) -> Result<()> {
        let id = self.droplet_id(instance, inventory).await?;
        progress::status(&format!("Powering on \"{}\", please wait...", instance.name));
        self.evented(&format!("droplets/{}/power_on", id), &[]).await?;
        progress::success(&format!("Instance \"{}\" powered on.", instance.name));
        self.wait_for_boot(&instance.name).await;
        self.refresh(id, inventory).await?;
        Ok(())
    }

    pub async fn shutdown(&self, instance: &Instance, inventory: &mut Inventory) -> Result<()> {
        let id = self.droplet_id(instance, inventory).await?;
        progress::status(&format!(
            "Shutting down instance \"{}\", please wait...",
            instance.name
        ));
        self.evented(&format!("droplets/{}/power_off", id), &[]).await?;
        progress::success(&format!("Instance \"{}\" has been shut down.", instance.name));
        self.refresh(id, inventory).await?;
        Ok(())
    }

    pub async fn reboot(&self, instance: &Instance, inventory: &mut Inventory) -> Result<()> {
        let id = self.droplet_id(instance, inventory).await?;
        progress::status(&format!("Rebooting \"{}\", please wait...", instance.name));
        self.evented(&format!("droplets/{}/reboot", id), &[]).await?;
        progress::success(&format!("Instance \"{}\" rebooted.", instance.name));
        self.wait_for_boot(&instance.name).await;
        self.refresh(id, inventory).await?;
        Ok(())
    }

    /// Shuts the droplet down, then snapshots it under `name`.
    pub async fn snapshot(
        &self,
        instance: &Instance,
        name: &str,
        inventory: &mut Inventory,
    ) -> Result<()> {
        self.shutdown(instance, inventory).await?;
        let id = self.droplet_id(instance, inventory).await?;
        progress::status(&format!(
            "Creating new snapshot \"{}\" of instance \"{}\", please wait...",
            name, instance.name
        ));
        self.evented(
            &format!("droplets/{}/snapshot", id),
            &[("name", name.to_string())],
        )
        .await?;
        progress::success(&format!("Snapshot \"{}\" created.", name));
        self.wait_for_boot(&instance.name).await;
        self.refresh(id, inventory).await?;
        Ok(())
    }

    pub async fn rebuild(
        &self,
        instance: &Instance,
        image: &ImageRef,
        inventory: &mut Inventory,
    ) -> Result<()> {
        let id = self.droplet_id(instance, inventory).await?;
        let image_id = match image {
            ImageRef::Id(image_id) => *image_id,
            other => self.find_image(other).await?.id,
        };
        progress::status(&format!(
            "Rebuilding \"{}\" using image \"{}\", please wait...",
            instance.name, image_id
        ));
        self.evented(
            &format!("droplets/{}/rebuild", id),
            &[("image_id", image_id.to_string())],
        )
        .await?;
        progress::success(&format!("Instance \"{}\" rebuilt.", instance.name));
        self.wait_for_boot(&instance.name).await;
        self.refresh(id, inventory).await?;
        Ok(())
    }

    /// Shuts the droplet down and resizes it. Powers it back on unless `skip_boot`.
    pub async fn resize(
        &self,
        instance: &Instance,
        size: &ResourceRef,
        skip_boot: bool,
        inventory: &mut Inventory,
    ) -> Result<()> {
        self.shutdown(instance, inventory).await?;
        let id = self.droplet_id(instance, inventory).await?;
        progress::status(&format!("Resizing \"{}\", please wait...", instance.name));
        let (key, value) = size.query("size");
        self.evented(&format!("droplets/{}/resize", id), &[(key.as_str(), value)])
            .await?;
        progress::success(&format!("Instance \"{}\" resized.", instance.name));
        if skip_boot {
            progress::status("Skipping droplet boot since --skip-boot was used.");
            self.refresh(id, inventory).await?;
            Ok(())
        } else {
            self.power_on(instance, inventory).await
        }
    }

    /// Destroys the droplet, scrubbing its data, and removes it from the inventory.
    pub async fn destroy(&self, instance: &Instance, inventory: &mut Inventory) -> Result<()> {
        let id = self.droplet_id(instance, inventory).await?;
        progress::status(&format!(
            "Destroying instance \"{}\", please wait...",
            instance.name
        ));
        let mut body = self
            .client
            .request(
                &format!("droplets/{}/destroy", id),
                &[("scrub_data", "1".to_string())],
            )
            .await?;
        let _event_id: u64 = take(&mut body, "event_id")?;
        progress::success(&format!("Instance \"{}\" destroyed.", instance.name));
        inventory.remove_instance(&instance.name)?;
        inventory.save()
    }
}

/// Stores a droplet's address and record on the instance of the same name.
fn record(inventory: &mut Inventory, droplet: Droplet) -> Result<()> {
    let value = serde_json::to_value(&droplet)?;
    inventory.update_instance(&droplet.name, |instance| {
        if let Some(address) = droplet.ip_address {
            instance.address = address;
        }
        instance.provider = Some(value);
    })?;
    inventory.save()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hashed_key_name_ignores_trailing_whitespace() {
        let name = hashed_key_name("ssh-ed25519 AAAA nimbus");
        assert!(name.starts_with("nimbus-"));
        assert_eq!(name.len(), "nimbus-".len() + 12);
        assert_eq!(name, hashed_key_name("ssh-ed25519 AAAA nimbus\n"));
        assert_ne!(name, hashed_key_name("ssh-ed25519 BBBB nimbus"));
    }

    #[test]
    fn test_resource_ref_query() {
        assert_eq!(
            ResourceRef::Id(66).query("size"),
            ("size_id".to_string(), "66".to_string())
        );
        assert_eq!(
            ResourceRef::Slug("nyc2".into()).query("region"),
            ("region_slug".to_string(), "nyc2".to_string())
        );
    }

    #[test]
    fn test_droplet_keeps_unknown_fields() {
        let droplet: Droplet = serde_json::from_value(serde_json::json!({
            "id": 100823,
            "name": "web.01",
            "ip_address": "10.0.0.5",
            "status": "active",
            "region_id": 4,
        }))
        .unwrap();
        assert_eq!(droplet.ip_address.as_deref(), Some("10.0.0.5"));

        let value = serde_json::to_value(&droplet).unwrap();
        assert_eq!(value["region_id"], 4);
        assert_eq!(value["id"], 100823);
    }
}
