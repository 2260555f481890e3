//! Resource synthesis behind the provisioning workflow.
//!
//! [`ResourceBackend`] is the seam a real provisioning engine plugs into.
//! Two implementations ship with the crate:
//! - [`MockBackend`] invents addresses from the configured address space.
//! - [`PoolBackend`] claims real slots through the [`Allocator`].

use std::future::Future;

use rand::Rng;
use tracing::debug;

use crate::config::{MockConfig, TemplateCatalog};
use crate::error::{ProvisionError, Result};
use crate::pool::Allocator;
use crate::state_machine::{AccessTarget, ProvisionRequest, RequestId, Resources};

const SLUG_MAX_LEN: usize = 20;

/// Produces the resources of a request and gives them back on teardown.
pub trait ResourceBackend: Send + Sync + 'static {
    /// Fail fast when the request obviously cannot be satisfied.
    fn check_capacity(&self, template: &str) -> impl Future<Output = Result<()>> + Send;

    /// Build the final resource descriptor for `request`.
    fn provision(&self, request: &ProvisionRequest) -> impl Future<Output = Result<Resources>> + Send;

    /// Return anything held for `request_id`. Must be idempotent.
    fn release(&self, request_id: RequestId) -> impl Future<Output = ()> + Send;
}

/// URL-safe slug of a display name: lowercase, hyphens for spaces, capped.
///
/// Only an empty name falls back to `svc`; surrounding whitespace is kept
/// and becomes hyphens like any other space.
pub fn slugify(name: &str) -> String {
    let source = if name.is_empty() { "svc" } else { name };
    source
        .replace(' ', "-")
        .to_lowercase()
        .chars()
        .take(SLUG_MAX_LEN)
        .collect()
}

/// Assemble the descriptor; the first address becomes the primary one.
///
/// A descriptor without any address is a fault, never a completed request.
pub fn describe(name: &str, addresses: Vec<String>, mock: &MockConfig) -> Result<Resources> {
    let Some(primary_address) = addresses.first().cloned() else {
        return Err(ProvisionError::WorkflowFault(format!(
            "no addresses allocated for {name:?}"
        )));
    };
    let slug = slugify(name);
    let access_targets = addresses
        .into_iter()
        .map(|host| AccessTarget {
            host,
            port: mock.ssh_port,
            user: mock.ssh_user.clone(),
        })
        .collect();

    Ok(Resources {
        primary_address,
        web_url: mock.web_url_template.replace("{slug}", &slug),
        db_vip: format!("db-{slug}{}", mock.db_vip_suffix),
        access_targets,
    })
}

/// Synthesizes addresses without touching any pool.
#[derive(Debug, Clone)]
pub struct MockBackend {
    mock: MockConfig,
    catalog: TemplateCatalog,
}

impl MockBackend {
    pub fn new(mock: MockConfig, catalog: TemplateCatalog) -> Self {
        Self { mock, catalog }
    }

    fn addresses(&self, count: usize) -> Vec<String> {
        let mut rng = rand::thread_rng();
        (0..count.max(1))
            .map(|_| {
                let host: u8 = rng.gen_range(1..=254);
                format!("{}.{}.{host}", self.mock.address_base, self.mock.address_second)
            })
            .collect()
    }
}

impl ResourceBackend for MockBackend {
    async fn check_capacity(&self, _template: &str) -> Result<()> {
        Ok(())
    }

    async fn provision(&self, request: &ProvisionRequest) -> Result<Resources> {
        let count = self.catalog.slot_count(&request.template);
        let addresses = self.addresses(count);
        debug!(request_id = %request.id, count, "synthesized mock addresses");
        describe(&request.name, addresses, &self.mock)
    }

    async fn release(&self, _request_id: RequestId) {}
}

/// Routes resource synthesis through the slot allocator.
#[derive(Debug, Clone)]
pub struct PoolBackend {
    allocator: Allocator,
    mock: MockConfig,
    owner_tag: Option<String>,
}

impl PoolBackend {
    pub fn new(allocator: Allocator, mock: MockConfig, owner_tag: Option<String>) -> Self {
        Self {
            allocator,
            mock,
            owner_tag,
        }
    }

    pub fn allocator(&self) -> &Allocator {
        &self.allocator
    }
}

impl ResourceBackend for PoolBackend {
    async fn check_capacity(&self, template: &str) -> Result<()> {
        self.allocator.has_capacity_for(template).await
    }

    async fn provision(&self, request: &ProvisionRequest) -> Result<Resources> {
        let slots = self
            .allocator
            .claim_for_template(request.id, &request.template, self.owner_tag.as_deref())
            .await?;
        let addresses = slots.into_iter().map(|slot| slot.address).collect();
        describe(&request.name, addresses, &self.mock)
    }

    async fn release(&self, request_id: RequestId) {
        self.allocator.release(request_id).await;
    }
}
