//! Service catalog: a read-side view over the endpoint registry

use crate::registry::EndpointRegistry;
use meshhub_proto::{ProviderRef, ServiceEntry};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Which `(protocol, name)` services exist and which endpoints advertise them.
///
/// Nothing is cached; every query is computed from a fresh registry snapshot.
#[derive(Clone)]
pub struct ServiceCatalog {
    registry: Arc<EndpointRegistry>,
}

impl ServiceCatalog {
    pub fn new(registry: Arc<EndpointRegistry>) -> Self {
        Self { registry }
    }

    /// Endpoints advertising `(protocol, name)`, in join order
    pub fn providers(&self, protocol: &str, name: &str) -> Vec<ProviderRef> {
        self.registry
            .list_all()
            .into_iter()
            .filter(|ep| {
                ep.services
                    .iter()
                    .any(|s| s.protocol == protocol && s.name == name)
            })
            .map(|ep| ProviderRef {
                id: ep.id,
                name: ep.name,
            })
            .collect()
    }

    /// All services, optionally restricted to one endpoint, sorted by protocol then name
    pub fn entries(&self, endpoint: Option<&str>) -> Vec<ServiceEntry> {
        let mut grouped: BTreeMap<(String, String), Vec<ProviderRef>> = BTreeMap::new();

        for ep in self.registry.list_all() {
            if endpoint.is_some_and(|id| id != ep.id) {
                continue;
            }
            for service in &ep.services {
                grouped
                    .entry((service.protocol.clone(), service.name.clone()))
                    .or_default()
                    .push(ProviderRef {
                        id: ep.id.clone(),
                        name: ep.name.clone(),
                    });
            }
        }

        grouped
            .into_iter()
            .map(|((protocol, name), endpoints)| ServiceEntry {
                protocol,
                name,
                endpoints,
            })
            .collect()
    }

    /// Whether endpoint `id` currently advertises `(protocol, name)`
    pub fn is_advertised(&self, id: &str, protocol: &str, name: &str) -> bool {
        self.registry.services(id).is_some_and(|services| {
            services
                .iter()
                .any(|s| s.protocol == protocol && s.name == name)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::Origin;
    use meshhub_proto::{ServiceSpec, StatusReport};
    use std::net::SocketAddr;

    fn registry_with(endpoints: &[(&str, &str, Vec<ServiceSpec>)]) -> Arc<EndpointRegistry> {
        let registry = Arc::new(EndpointRegistry::new());
        let origin = Origin {
            remote_addr: SocketAddr::from(([127, 0, 0, 1], 1)),
            local_addr: SocketAddr::from(([127, 0, 0, 1], 2)),
            certificate: None,
        };
        for (id, name, services) in endpoints {
            registry.get_or_create(id, &origin).unwrap();
            registry
                .heartbeat(
                    id,
                    StatusReport {
                        name: name.to_string(),
                        labels: vec![],
                    },
                )
                .unwrap();
            registry.publish_services(id, services.clone()).unwrap();
        }
        registry
    }

    #[test]
    fn test_providers_of_service() {
        let registry = registry_with(&[
            ("e1", "box1", vec![ServiceSpec::new("ssh", "tcp")]),
            ("e2", "box2", vec![ServiceSpec::new("web", "tcp")]),
            ("e3", "box3", vec![ServiceSpec::new("ssh", "tcp")]),
        ]);
        let catalog = ServiceCatalog::new(registry);

        let providers = catalog.providers("tcp", "ssh");
        assert_eq!(
            providers,
            vec![
                ProviderRef {
                    id: "e1".to_string(),
                    name: "box1".to_string()
                },
                ProviderRef {
                    id: "e3".to_string(),
                    name: "box3".to_string()
                },
            ]
        );
        assert!(catalog.providers("udp", "ssh").is_empty());
    }

    #[test]
    fn test_entries_reflect_latest_publish() {
        let registry = registry_with(&[
            ("e1", "box1", vec![ServiceSpec::new("ssh", "tcp")]),
            ("e2", "box2", vec![ServiceSpec::new("ssh", "tcp"), ServiceSpec::new("dns", "udp")]),
        ]);
        let catalog = ServiceCatalog::new(registry.clone());

        let entries = catalog.entries(None);
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].protocol, "tcp");
        assert_eq!(entries[0].endpoints.len(), 2);
        assert_eq!(entries[1].name, "dns");

        let only_e1 = catalog.entries(Some("e1"));
        assert_eq!(only_e1.len(), 1);
        assert_eq!(only_e1[0].endpoints[0].id, "e1");

        // Removal is visible on the next query
        registry.publish_services("e1", vec![]).unwrap();
        assert!(!catalog.is_advertised("e1", "tcp", "ssh"));
        assert_eq!(catalog.providers("tcp", "ssh").len(), 1);
        assert!(catalog.entries(Some("e1")).is_empty());
    }
}
